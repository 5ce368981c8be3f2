//! The worker-facing job queue.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::job::Job;

/// Errors returned by [`JobQueue`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue no longer accepts jobs.
    #[error("The job queue is shut down")]
    Closed,
}

/// Concurrent FIFO of queued jobs with a cooperative shutdown latch.
///
/// Built on an unbounded [`mpsc`] channel: [`JobQueue::push`] never blocks,
/// [`JobQueue::pop`] awaits the next item, and [`JobQueue::shutdown`] drops
/// the sender so the channel drains its remaining items before `pop`
/// starts returning `None`. Any number of producers and workers may share
/// one queue; each item is delivered to exactly one worker, in FIFO order.
pub struct JobQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Arc<Job>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Job>>>,
}

impl JobQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Appends a job to the queue. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once [`JobQueue::shutdown`] has been
    /// called.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn push(&self, job: Arc<Job>) -> Result<(), QueueError> {
        let tx = self.tx.lock().expect("job queue sender lock poisoned");
        let Some(tx) = tx.as_ref() else {
            return Err(QueueError::Closed);
        };
        tx.send(job).map_err(|_| QueueError::Closed)
    }

    /// Waits for the next job.
    ///
    /// Returns `None` once the queue has been shut down and drained — the
    /// signal for a worker to exit.
    pub async fn pop(&self) -> Option<Arc<Job>> {
        self.rx.lock().await.recv().await
    }

    /// Stops accepting new jobs. Items already queued are still delivered;
    /// afterwards every `pop` returns `None`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn shutdown(&self) {
        self.tx
            .lock()
            .expect("job queue sender lock poisoned")
            .take();
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(layer: &str) -> Arc<Job> {
        Arc::new(Job::new(layer, None))
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queue = JobQueue::new();
        queue.push(job("a")).unwrap();
        queue.push(job("b")).unwrap();
        queue.push(job("c")).unwrap();

        assert_eq!(queue.pop().await.unwrap().layer_name(), "a");
        assert_eq!(queue.pop().await.unwrap().layer_name(), "b");
        assert_eq!(queue.pop().await.unwrap().layer_name(), "c");
    }

    #[tokio::test]
    async fn shutdown_drains_pending_items_then_signals() {
        let queue = JobQueue::new();
        queue.push(job("a")).unwrap();
        queue.push(job("b")).unwrap();
        queue.shutdown();

        assert_eq!(queue.pop().await.unwrap().layer_name(), "a");
        assert_eq!(queue.pop().await.unwrap().layer_name(), "b");
        assert!(queue.pop().await.is_none());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn push_after_shutdown_is_rejected() {
        let queue = JobQueue::new();
        queue.shutdown();
        assert!(matches!(queue.push(job("a")), Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn pop_wakes_blocked_workers_on_shutdown() {
        let queue = Arc::new(JobQueue::new());
        let waiting = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.shutdown();

        assert!(waiting.await.unwrap().is_none());
    }
}
