use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Restart policy for a supervised background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePriority {
    /// Scheduler, config watcher — restart indefinitely
    Critical,
    /// Auxiliary services — restart slowly, bounded retries
    Background,
}

impl ServicePriority {
    fn max_retries(self) -> u32 {
        match self {
            Self::Critical => u32::MAX,
            Self::Background => 5,
        }
    }

    fn backoff(self, retry: u32) -> Duration {
        match self {
            Self::Critical => Duration::from_millis(200 * retry as u64),
            Self::Background => Duration::from_secs(5 * retry as u64),
        }
    }
}

/// Run a service inside a supervised tokio task.
///
/// The service is restarted after an error or a panic according to its
/// priority. A clean `Ok(())` exit (cooperative shutdown) stops supervision.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    priority: ServicePriority,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let max_retries = priority.max_retries();
        let mut retries: u32 = 0;
        let mut last_restart = Instant::now();

        loop {
            info!("[supervisor] Starting service: {name}");

            let f = Arc::clone(&factory);
            let result = tokio::spawn(async move { f().await }).await;

            match result {
                Ok(Ok(())) => {
                    info!("[supervisor] {name} exited cleanly");
                    break;
                }
                Ok(Err(e)) => {
                    error!("[supervisor] {name} failed: {e:#}");
                }
                Err(join_error) => {
                    error!("[supervisor] {name} task panicked: {join_error}");
                }
            }

            // A service that ran for a while gets a fresh retry budget
            if last_restart.elapsed() > Duration::from_secs(60) {
                retries = 0;
            }

            retries = retries.saturating_add(1);

            if retries > max_retries {
                error!("[supervisor] {name} exceeded max retries ({max_retries}), giving up");
                break;
            }

            let backoff = priority.backoff(retries);
            warn!("[supervisor] {name} restarting in {backoff:?} (attempt {retries})");
            tokio::time::sleep(backoff).await;
            last_restart = Instant::now();
        }
    })
}
