//! Stage queue abstraction.
//!
//! Workers drain a queue of claimed work items. The transport is pluggable:
//! the in-process queue below backs batch runs and tests; a durable broker
//! can implement the same trait for multi-host deployments. Either way the
//! store remains the ledger of record - acknowledgement is the status
//! transition that commits with the stage result, never the queue pop - so
//! losing a popped item only delays it until the next claim.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

/// Source of work items for one stage's worker pool.
#[async_trait]
pub trait TaskQueue<T: Send>: Send + Sync {
    /// Next item, or `None` when the queue is drained.
    async fn pop(&self) -> Option<T>;
}

/// In-process queue over a claimed batch.
pub struct InProcessQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> InProcessQueue<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(VecDeque::from(items)),
        }
    }
}

#[async_trait]
impl<T: Send> TaskQueue<T> for InProcessQueue<T> {
    async fn pop(&self) -> Option<T> {
        self.items.lock().expect("queue lock").pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pop_until_drained() {
        let queue = InProcessQueue::new(vec![1, 2, 3]);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_concurrent_consumers_see_each_item_once() {
        let queue = Arc::new(InProcessQueue::new((0..100).collect::<Vec<_>>()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = queue.pop().await {
                    seen.push(item);
                }
                seen
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
