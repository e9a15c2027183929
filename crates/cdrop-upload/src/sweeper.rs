//! Cancellable periodic background tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn a task that runs `tick` every `every` until `cancel` fires.
///
/// The first run happens one full period after spawning. A tick that overruns
/// the period delays the next one instead of bursting.
///
/// # Panics
///
/// Panics if `every` is zero, or if called outside a tokio runtime.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        info!(task = name, every_secs = every.as_secs(), "periodic task started");
        let mut timer = interval_at(Instant::now() + every, every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(task = name, "periodic task stopped");
                    break;
                }
                _ = timer.tick() => {
                    debug!(task = name, "periodic task tick");
                    tick().await;
                }
            }
        }
    })
}
