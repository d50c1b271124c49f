// Background task supervision

use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns every background task of a node and stops them together
#[derive(Debug, Default)]
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on shutdown, for tasks that watch it themselves
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a task that stops on its own once the token is cancelled
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "Spawning task");
        let handle = tokio::spawn(task);
        self.tasks.lock().push((name, handle));
    }

    /// Run `tick` every `interval` until shutdown. The first run happens one
    /// interval after spawning; overrunning ticks are delayed, not bunched.
    pub fn spawn_periodic<F, Fut>(&self, name: impl Into<String>, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let name = name.into();
        let task_name = name.clone();

        self.spawn(name, async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tick() => {}
                }
            }
            debug!(task = %task_name, "Periodic task stopped");
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();

        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        for (name, joined) in names.iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                warn!(task = %name, error = %e, "Task ended abnormally");
            }
        }
        info!(tasks = count, "Background tasks stopped");
    }
}
