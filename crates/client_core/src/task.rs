use std::{future::Future, time::Duration};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

/// A running background loop. Stop it with [`PollHandle::stop`]; dropping the
/// handle aborts the task instead of leaving it running.
#[must_use = "dropping a PollHandle aborts its task"]
pub struct PollHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(body(rx));
        Self {
            name: name.into(),
            shutdown,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signals shutdown and waits for the loop to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(()) => debug!(task = %self.name, "background task stopped"),
                Err(err) if err.is_cancelled() => {}
                Err(err) => warn!(task = %self.name, "background task failed: {err}"),
            }
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Sleeps for `interval` unless shutdown is requested first. Returns `true`
/// when the loop should exit.
pub async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let closed = tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    closed || *shutdown.borrow()
}
