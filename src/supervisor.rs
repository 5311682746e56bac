use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use crate::errors::ChainResult;

/// Keeps long-running node activities alive.
///
/// Each supervised activity is rebuilt from its factory and relaunched after
/// `restart_delay` whenever it returns an error or panics. An activity that
/// returns `Ok(())` is considered finished and is not restarted.
#[derive(Clone, Debug)]
pub struct Supervisor {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    restart_delay: Duration,
}

impl Supervisor {
    pub fn new(restart_delay: Duration) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
            restart_delay,
        }
    }

    pub fn spawn<F, Fut>(&self, name: &'static str, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChainResult<()>> + Send + 'static,
    {
        let restart_delay = self.restart_delay;
        let handle = tokio::spawn(async move {
            loop {
                // A nested task turns a panic into a JoinError instead of
                // tearing down the supervisor loop.
                let task = tokio::spawn(factory());
                let _abort = AbortOnDrop(task.abort_handle());
                match task.await {
                    Ok(Ok(())) => {
                        info!(task = name, "supervised task finished");
                        return;
                    }
                    Ok(Err(err)) => {
                        warn!(task = name, %err, "supervised task failed; restarting");
                    }
                    Err(err) if err.is_cancelled() => return,
                    Err(err) => {
                        warn!(task = name, %err, "supervised task panicked; restarting");
                    }
                }
                tokio::time::sleep(restart_delay).await;
            }
        });
        self.tasks.lock().push(handle);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Stops every supervised task and waits for them to unwind.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(%err, "supervised task aborted abnormally");
                }
            }
        }
    }
}

/// Aborts the inner task when the supervising loop is itself aborted.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
