//! Per-bundle job queue.
//!
//! An unbounded FIFO with task accounting: every [`put`](JobQueue::put)
//! increments an unfinished counter that only [`task_done`](JobQueue::task_done)
//! (or [`close`](JobQueue::close)) decrements, so [`join`](JobQueue::join)
//! waits for jobs to be *processed*, not merely dequeued.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::warn;

/// One enqueued invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub function: String,
    pub body: Value,
    pub extras: Map<String, Value>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: VecDeque<Job>,
    unfinished: usize,
}

/// FIFO of [`Job`]s shared by producers and one consumer.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    available: Notify,
    drained: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The critical sections never panic; recover the data regardless.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a job. Never blocks.
    pub fn put(&self, job: Job) {
        {
            let mut inner = self.lock();
            inner.jobs.push_back(job);
            inner.unfinished += 1;
        }
        self.available.notify_one();
    }

    /// Removes the oldest job, waiting while the queue is empty.
    pub async fn get(&self) -> Job {
        loop {
            let notified = self.available.notified();
            if let Some(job) = self.lock().jobs.pop_front() {
                return job;
            }
            notified.await;
        }
    }

    /// Marks one previously fetched job as processed.
    pub fn task_done(&self) {
        let drained = {
            let mut inner = self.lock();
            if inner.unfinished == 0 {
                warn!("task_done called more times than jobs were queued");
                return;
            }
            inner.unfinished -= 1;
            inner.unfinished == 0
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Waits until every job put so far has been processed.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().unfinished == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Retires the queue once its consumer is gone: drops every job not
    /// yet fetched, forgets the in-flight one and releases all joiners.
    /// Returns how many queued jobs were dropped.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut inner = self.lock();
            let dropped = inner.jobs.len();
            inner.jobs.clear();
            inner.unfinished = 0;
            dropped
        };
        self.drained.notify_waiters();
        dropped
    }

    /// Jobs waiting to be fetched.
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs put but not yet marked done.
    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn job(n: u64) -> Job {
        Job {
            function: "app:f".to_string(),
            body: Value::from(n),
            extras: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new();
        for n in 0..3 {
            queue.put(job(n));
        }
        for n in 0..3 {
            assert_eq!(queue.get().await.body, Value::from(n));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.unfinished(), 3);
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let queue = Arc::new(JobQueue::new());
        let getter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!getter.is_finished());

        queue.put(job(7));
        let got = tokio::time::timeout(Duration::from_secs(1), getter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.body, Value::from(7));
    }

    #[tokio::test]
    async fn test_join_waits_for_task_done() {
        let queue = Arc::new(JobQueue::new());
        queue.put(job(1));
        queue.put(job(2));

        let joiner = tokio::spawn({
            let queue = queue.clone();
            async move { queue.join().await }
        });

        queue.get().await;
        queue.task_done();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!joiner.is_finished());

        queue.get().await;
        queue.task_done();
        tokio::time::timeout(Duration::from_secs(1), joiner)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_on_empty_queue_returns() {
        let queue = JobQueue::new();
        tokio::time::timeout(Duration::from_millis(100), queue.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_joiners() {
        let queue = Arc::new(JobQueue::new());
        queue.put(job(1));
        queue.put(job(2));
        let _in_flight = queue.get().await;

        let joiner = tokio::spawn({
            let queue = queue.clone();
            async move { queue.join().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!joiner.is_finished());

        // The in-flight job is never marked done; closing alone must
        // release the joiner.
        assert_eq!(queue.close(), 1);
        assert_eq!(queue.unfinished(), 0);
        assert!(queue.is_empty());
        tokio::time::timeout(Duration::from_millis(100), joiner)
            .await
            .unwrap()
            .unwrap();
    }
}
