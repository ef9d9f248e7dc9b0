use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::options::{ClientOptions, Priority};
use crate::util::lock_unpoisoned;

pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// One unit of scheduled work: optional raw-request bytes, the target
/// message record and a frozen snapshot of the submitter's options.
pub(crate) struct PendingItem {
    pub(crate) raw: Option<String>,
    pub(crate) message: Arc<Message>,
    pub(crate) options: ClientOptions,
}

enum TryEnqueue {
    Stored,
    Full(PendingItem),
    Closed(PendingItem),
}

/// Priority → bounded FIFO mapping with strict-priority dequeue.
///
/// FIFOs are created lazily on first submission at a priority. A full FIFO
/// suspends the submitter (backpressure); an empty set suspends workers
/// until any FIFO becomes non-empty or the engine is cancelled.
pub(crate) struct PriorityQueueSet {
    queues: Mutex<BTreeMap<Priority, VecDeque<PendingItem>>>,
    capacity: usize,
    pending: AtomicUsize,
    closed: AtomicBool,
    item_ready: Notify,
    space_ready: Notify,
}

impl PriorityQueueSet {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stores the item under its priority, suspending while the FIFO is
    /// full. Returns the item back when the set has been closed.
    pub(crate) async fn enqueue(
        &self,
        priority: Priority,
        item: PendingItem,
    ) -> Result<(), PendingItem> {
        let mut item = item;
        loop {
            let space = self.space_ready.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_enqueue(priority, item) {
                TryEnqueue::Stored => {
                    self.item_ready.notify_waiters();
                    return Ok(());
                }
                TryEnqueue::Closed(returned) => return Err(returned),
                TryEnqueue::Full(returned) => {
                    item = returned;
                    space.await;
                }
            }
        }
    }

    fn try_enqueue(&self, priority: Priority, item: PendingItem) -> TryEnqueue {
        if self.is_closed() {
            return TryEnqueue::Closed(item);
        }
        let mut queues = lock_unpoisoned(&self.queues);
        let queue = queues.entry(priority).or_default();
        if queue.len() >= self.capacity {
            return TryEnqueue::Full(item);
        }
        queue.push_back(item);
        self.pending.fetch_add(1, Ordering::SeqCst);
        TryEnqueue::Stored
    }

    /// Pops the front of the highest-priority non-empty FIFO, suspending
    /// while every FIFO is empty. `None` means the engine was cancelled or
    /// the set closed.
    pub(crate) async fn dequeue_highest(
        &self,
        cancel: &CancellationToken,
    ) -> Option<PendingItem> {
        loop {
            let ready = self.item_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if let Some(item) = self.try_dequeue() {
                self.space_ready.notify_waiters();
                return Some(item);
            }
            if self.is_closed() || cancel.is_cancelled() {
                return None;
            }

            tokio::select! {
                _ = &mut ready => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    fn try_dequeue(&self) -> Option<PendingItem> {
        let mut queues = lock_unpoisoned(&self.queues);
        for (_, queue) in queues.iter_mut().rev() {
            if let Some(item) = queue.pop_front() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                return Some(item);
            }
        }
        None
    }

    /// Marks the set closed and hands back everything still pending so the
    /// caller can fire the orphaned resolutions.
    pub(crate) fn close_and_drain(&self) -> Vec<PendingItem> {
        self.closed.store(true, Ordering::SeqCst);
        let mut queues = lock_unpoisoned(&self.queues);
        let mut drained = Vec::new();
        for (_, queue) in queues.iter_mut().rev() {
            drained.extend(queue.drain(..));
        }
        self.pending.store(0, Ordering::SeqCst);
        drop(queues);
        self.item_ready.notify_waiters();
        self.space_ready.notify_waiters();
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{PendingItem, PriorityQueueSet};
    use crate::message::{Message, PreparedRequest};
    use crate::options::ClientOptions;

    fn item(label: &str) -> PendingItem {
        let request =
            PreparedRequest::get(&format!("http://example.com/{label}")).expect("request url");
        PendingItem {
            raw: None,
            message: Message::new(request),
            options: ClientOptions::default(),
        }
    }

    fn label(item: &PendingItem) -> String {
        item.message.request().url.path().trim_start_matches('/').to_owned()
    }

    #[tokio::test]
    async fn strict_priority_then_fifo_within_priority() {
        let queues = PriorityQueueSet::new(16);
        let cancel = CancellationToken::new();

        queues.enqueue(1, item("a")).await.ok().unwrap();
        queues.enqueue(5, item("b")).await.ok().unwrap();
        queues.enqueue(1, item("c")).await.ok().unwrap();
        queues.enqueue(5, item("d")).await.ok().unwrap();

        let order: Vec<String> = [
            queues.dequeue_highest(&cancel).await.unwrap(),
            queues.dequeue_highest(&cancel).await.unwrap(),
            queues.dequeue_highest(&cancel).await.unwrap(),
            queues.dequeue_highest(&cancel).await.unwrap(),
        ]
        .iter()
        .map(label)
        .collect();

        assert_eq!(order, ["b", "d", "a", "c"]);
        assert_eq!(queues.pending_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure_until_a_dequeue() {
        let queues = Arc::new(PriorityQueueSet::new(1));
        let cancel = CancellationToken::new();

        queues.enqueue(1, item("first")).await.ok().unwrap();

        let blocked = {
            let queues = Arc::clone(&queues);
            tokio::spawn(async move { queues.enqueue(1, item("second")).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "enqueue should block while full");

        let first = queues.dequeue_highest(&cancel).await.unwrap();
        assert_eq!(label(&first), "first");

        blocked.await.expect("join").ok().unwrap();
        let second = queues.dequeue_highest(&cancel).await.unwrap();
        assert_eq!(label(&second), "second");
    }

    #[tokio::test]
    async fn dequeue_wakes_on_late_enqueue() {
        let queues = Arc::new(PriorityQueueSet::new(4));
        let cancel = CancellationToken::new();

        let waiter = {
            let queues = Arc::clone(&queues);
            let cancel = cancel.clone();
            tokio::spawn(async move { queues.dequeue_highest(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        queues.enqueue(1, item("late")).await.ok().unwrap();

        let dequeued = waiter.await.expect("join").expect("item");
        assert_eq!(label(&dequeued), "late");
    }

    #[tokio::test]
    async fn cancellation_unblocks_dequeue() {
        let queues = PriorityQueueSet::new(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queues.dequeue_highest(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn close_drains_in_priority_order_and_rejects_new_items() {
        let queues = PriorityQueueSet::new(8);
        queues.enqueue(1, item("low")).await.ok().unwrap();
        queues.enqueue(9, item("high")).await.ok().unwrap();

        let drained = queues.close_and_drain();
        let labels: Vec<String> = drained.iter().map(label).collect();
        assert_eq!(labels, ["high", "low"]);

        assert!(queues.enqueue(1, item("rejected")).await.is_err());
        assert_eq!(queues.pending_count(), 0);
    }
}
