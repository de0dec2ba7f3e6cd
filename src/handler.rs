//! Hot-reloadable resolution of a slot's current consumers and pipelines.

use async_trait::async_trait;

use crate::assembler::EnrichedChange;
use crate::errors::ReplicationResult;
use crate::router::{Consumer, Pipeline};

/// The consumers/pipelines attached to a slot at a point in time, re-read
/// on every dispatch rather than cached for the session — so that adding
/// or removing a subscription takes effect without a reconnect.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    pub slot_id: String,
    pub consumers: Vec<Consumer>,
    pub pipelines: Vec<Pipeline>,
}

#[derive(Debug)]
pub struct HandleOutcome {
    pub ok: bool,
    pub count: usize,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn context(&self, slot_id: &str) -> ReplicationResult<HandlerContext>;

    async fn handle_messages(
        &self,
        ctx: &HandlerContext,
        changes: &[EnrichedChange],
    ) -> ReplicationResult<HandleOutcome>;
}

/// A `MessageHandler` backed by a fixed, in-process subscription list —
/// the dev/test counterpart to a handler that reloads subscriptions from
/// an external configuration store.
pub struct StaticHandler {
    context: HandlerContext,
}

impl StaticHandler {
    pub fn new(slot_id: impl Into<String>, consumers: Vec<Consumer>, pipelines: Vec<Pipeline>) -> Self {
        Self {
            context: HandlerContext {
                slot_id: slot_id.into(),
                consumers,
                pipelines,
            },
        }
    }
}

#[async_trait]
impl MessageHandler for StaticHandler {
    async fn context(&self, _slot_id: &str) -> ReplicationResult<HandlerContext> {
        Ok(self.context.clone())
    }

    async fn handle_messages(
        &self,
        _ctx: &HandlerContext,
        changes: &[EnrichedChange],
    ) -> ReplicationResult<HandleOutcome> {
        Ok(HandleOutcome {
            ok: true,
            count: changes.len(),
        })
    }
}

