use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use relaygate_types::SessionState;

use super::SessionManager;

/// Spawns the background sweep that closes sessions which have gone idle
/// longer than `stale_threshold`, and evicts rate-limit buckets that have
/// seen no traffic in the same window. Returns a token the caller cancels to
/// stop the sweep during the shutdown sequence.
pub fn start(manager: Arc<SessionManager>, interval: Duration, stale_threshold: Duration) -> CancellationToken {
	let shutdown = CancellationToken::new();
	let token = shutdown.clone();

	tokio::spawn(async move {
		let mut tick = tokio::time::interval(interval);
		loop {
			tokio::select! {
				_ = tick.tick() => {}
				_ = shutdown.cancelled() => {
					info!("session reaper stopping");
					return;
				}
			}

			let stale_ms = stale_threshold.as_millis() as i64;
			let mut reaped = 0usize;
			for entry in manager.registry.all() {
				if entry.idle_for_ms() > stale_ms {
					entry.reaped.store(true, std::sync::atomic::Ordering::Relaxed);
					entry.cancel.cancel();
					manager.close_session(&entry.session_id, SessionState::Failed).await;
					reaped += 1;
				}
			}
			manager.rate_limiter.evict_idle(stale_ms);
			if reaped > 0 {
				info!(reaped, "session reaper closed stale sessions");
			}
		}
	});

	token
}
