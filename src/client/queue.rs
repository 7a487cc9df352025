//! The peer queue: a bounded, single-producer/many-consumer endpoint
//! queue shared by every worker task.
//!
//! Modeled as a `Notify`-guarded `VecDeque` rather than a `tokio::sync::
//! mpsc` channel: the orchestrator is deliberately single-threaded (every
//! worker runs on the same `LocalSet`), so there is no cross-thread
//! handoff to synchronize, just suspension points. `get` suspends while
//! the queue is empty; `put` suspends while it is at capacity.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::sync::Notify;

struct Inner {
    items: RefCell<VecDeque<SocketAddr>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

/// A clonable handle to the shared peer queue. Clones are reference
/// counted (`Rc`), not independent queues.
#[derive(Clone)]
pub struct PeerQueue {
    inner: Rc<Inner>,
}

impl PeerQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Rc::new(Inner {
                items: RefCell::new(VecDeque::new()),
                capacity,
                not_empty: Notify::new(),
                not_full: Notify::new(),
            }),
        }
    }

    /// Enqueues `addr`, suspending while the queue is at capacity.
    /// Duplicate endpoints are allowed; a worker later dedupes at connect
    /// time (or the OS rejects a redundant connection) rather than the
    /// queue enforcing uniqueness.
    pub async fn put(&self, addr: SocketAddr) {
        loop {
            {
                let mut items = self.inner.items.borrow_mut();
                if items.len() < self.inner.capacity {
                    items.push_back(addr);
                    drop(items);
                    self.inner.not_empty.notify_one();
                    return;
                }
            }
            self.inner.not_full.notified().await;
        }
    }

    /// Dequeues the oldest endpoint, suspending while the queue is empty.
    pub async fn get(&self) -> SocketAddr {
        loop {
            {
                let mut items = self.inner.items.borrow_mut();
                if let Some(addr) = items.pop_front() {
                    drop(items);
                    self.inner.not_full.notify_one();
                    return addr;
                }
            }
            self.inner.not_empty.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn put_then_get_returns_in_fifo_order() {
        let queue = PeerQueue::new(4);
        queue.put(addr(1)).await;
        queue.put(addr(2)).await;
        assert_eq!(queue.get().await, addr(1));
        assert_eq!(queue.get().await, addr(2));
    }

    #[tokio::test]
    async fn get_suspends_until_an_item_is_put() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let queue = PeerQueue::new(4);
                let get_queue = queue.clone();
                let getter = tokio::task::spawn_local(async move { get_queue.get().await });

                tokio::task::yield_now().await;
                queue.put(addr(7)).await;

                assert_eq!(getter.await.unwrap(), addr(7));
            })
            .await;
    }

    #[tokio::test]
    async fn put_suspends_while_at_capacity() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let queue = PeerQueue::new(1);
                queue.put(addr(1)).await;
                assert_eq!(queue.len(), 1);

                let put_queue = queue.clone();
                let putter = tokio::task::spawn_local(async move {
                    put_queue.put(addr(2)).await;
                });

                tokio::task::yield_now().await;
                assert!(!putter.is_finished());

                assert_eq!(queue.get().await, addr(1));
                putter.await.unwrap();
                assert_eq!(queue.get().await, addr(2));
            })
            .await;
    }
}
