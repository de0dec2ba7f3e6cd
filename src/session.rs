//! Ties the byte framer, decoder, assembler, router, and persistor
//! together for one replication connection: `read_frame -> route -> maybe_ack`.
//!
//! libpq is synchronous, so the whole loop runs on a blocking task; the
//! few async collaborators (`MessageHandler`, `EventStore`) are driven
//! from inside it via `Handle::block_on`.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{error, info, warn};

use crate::ack::send_standby_status_update;
use crate::assembler::Assembler;
use crate::config::SlotConfig;
use crate::connection::{CatalogPool, PgConnection};
use crate::errors::{ReplicationError, ReplicationResult};
use crate::handler::MessageHandler;
use crate::lsn::Lsn;
use crate::protocol::{parse_frame, Frame};
use crate::router::route;
use crate::status::StatusRegistry;
use crate::store::{EventStore, Persistor};

/// One run of the replication loop over a single connection. Dropped and
/// recreated by the supervisor on every reconnect, so session state
/// (relation cache, assembler, last-acked LSN) never survives a reconnect,
/// matching the "Relation entries live for the slot's session" lifecycle.
pub struct Session<S: EventStore> {
    config: SlotConfig,
    handler: Arc<dyn MessageHandler>,
    persistor: Arc<Persistor<S>>,
    status: Arc<StatusRegistry>,
    catalog_pool: Arc<CatalogPool>,
}

impl<S: EventStore + 'static> Session<S> {
    pub fn new(
        config: SlotConfig,
        handler: Arc<dyn MessageHandler>,
        persistor: Arc<Persistor<S>>,
        status: Arc<StatusRegistry>,
        catalog_pool: Arc<CatalogPool>,
    ) -> Self {
        Self {
            config,
            handler,
            persistor,
            status,
            catalog_pool,
        }
    }

    /// Run one connection attempt to completion (or until a fatal error).
    /// Never retries internally — that is the supervisor's job.
    pub async fn run(self: Arc<Self>) -> ReplicationResult<()> {
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || self.run_blocking(runtime)).await?
    }

    fn run_blocking(&self, runtime: tokio::runtime::Handle) -> ReplicationResult<()> {
        let conninfo = self.config.connection.to_conninfo();
        let slot_id = self.config.id.clone();
        let catalog = self.catalog_pool.get_or_connect(&slot_id, &conninfo)?;
        let replication_conn = PgConnection::connect(&conninfo)?;

        let start_query = format!(
            "START_REPLICATION SLOT {} LOGICAL 0/0 (proto_version '1', publication_names '{}')",
            self.config.slot_name, self.config.publication
        );
        replication_conn.start_replication(&start_query).map_err(|e| {
            ReplicationError::connection(format!("failed to start replication: {e}"))
        })?;

        info!(slot_id, "entered CopyBoth mode, streaming logical changes");

        let mut assembler = Assembler::new();
        let mut last_flushed_lsn = Lsn::ZERO;

        loop {
            let Some(data) = replication_conn.get_copy_data()? else {
                warn!(slot_id, "replication stream ended");
                return Ok(());
            };

            match parse_frame(&data)? {
                Frame::XLogData(frame) => {
                    let message = crate::protocol::decode(&frame.payload)?;
                    if let Some(tx) = assembler.apply(message, &catalog)? {
                        let up_to_seq = tx.changes.last().map(|c| c.seq).unwrap_or(0);
                        let outcome = runtime.block_on(self.dispatch(&slot_id, &tx.changes, up_to_seq));

                        match outcome {
                            Ok(()) => {
                                last_flushed_lsn = tx.commit_lsn;
                                self.status.mark_committed(&slot_id, SystemTime::now());
                                send_standby_status_update(&replication_conn, last_flushed_lsn)?;
                            }
                            Err(e) => {
                                self.status.mark_unhealthy(&slot_id);
                                error!(slot_id, error = %e, "failed to persist transaction, will not ack");
                                return Err(e);
                            }
                        }
                    }
                }
                Frame::Keepalive(keepalive) => {
                    if keepalive.reply_requested {
                        let reply_lsn = if last_flushed_lsn == Lsn::ZERO {
                            keepalive.wal_end
                        } else {
                            last_flushed_lsn
                        };
                        send_standby_status_update(&replication_conn, reply_lsn)?;
                    }
                }
                Frame::Unknown(tag) => {
                    warn!(slot_id, tag, "unknown frame tag, skipped");
                }
            }
        }
    }

    async fn dispatch(
        &self,
        slot_id: &str,
        changes: &[crate::assembler::EnrichedChange],
        up_to_seq: u64,
    ) -> ReplicationResult<()> {
        let ctx = self.handler.context(slot_id).await?;

        let outcome = self.handler.handle_messages(&ctx, changes).await?;
        if !outcome.ok {
            return Err(ReplicationError::persistence(format!(
                "handler rejected a batch of {} change(s) for slot {slot_id}",
                outcome.count
            )));
        }

        let batch = route(changes, &ctx.consumers, &ctx.pipelines);
        self.persistor.persist(slot_id, up_to_seq, batch).await?;
        Ok(())
    }
}
