//! Owns socket lifecycle: reconnects a [`Session`] with exponential
//! backoff and jitter, and supports graceful stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::errors::ReplicationResult;
use crate::session::Session;
use crate::store::EventStore;

const BASE_DELAY_MS: u64 = 1_000;
const MAX_DELAY_MS: u64 = 30_000;

/// Signals a graceful stop to a running [`Supervisor::run`] loop. The
/// in-flight transaction buffer is discarded, never acked, so a restart
/// simply redelivers it from the last confirmed LSN.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Runs `session` until `shutdown` is signaled, reconnecting on any error
/// with exponential backoff, jittered, capped at [`MAX_DELAY_MS`]
/// (`delay_ms = (delay_ms * 2).min(max)`).
pub async fn run<S: EventStore + 'static>(
    session: Arc<Session<S>>,
    slot_id: &str,
    shutdown: ShutdownHandle,
) -> ReplicationResult<()> {
    let mut delay_ms = BASE_DELAY_MS;

    loop {
        if shutdown.is_stopped() {
            info!(slot_id, "shutdown requested, stopping supervisor");
            return Ok(());
        }

        match session.clone().run().await {
            Ok(()) => {
                info!(slot_id, "replication stream ended cleanly, reattaching");
                delay_ms = BASE_DELAY_MS;
            }
            Err(e) => {
                error!(slot_id, error = %e, "session failed, will reconnect");
                delay_ms = jittered(delay_ms);
                warn!(slot_id, delay_ms, "backing off before reconnect");
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }

        if shutdown.is_stopped() {
            info!(slot_id, "shutdown requested after session exit");
            return Ok(());
        }
    }
}

/// Jitter up to 25% of `delay_ms`, derived from the clock rather than a
/// dedicated RNG crate — good enough to desynchronize reconnecting slots
/// without pulling in a new dependency the rest of the stack doesn't use.
fn jittered(delay_ms: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let jitter_fraction = (nanos % 250) as u64;
    delay_ms + (delay_ms * jitter_fraction) / 1000
}
