use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// A broadcast list with O(1) attach and detach: every subscribed peer
/// stream holds one unbounded queue, and [`Subscribers::notify`] enqueues
/// on all of them without ever blocking. Slow consumers grow their queue
/// rather than stalling anyone else.
pub struct Subscribers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

struct Registry<T> {
    next_id: u64,
    queues: HashMap<u64, mpsc::UnboundedSender<T>>,
}

/// Detaches its queue from the list when dropped.
pub struct Subscription<T> {
    inner: Arc<Mutex<Registry<T>>>,
    id: u64,
}

impl<T: Clone> Subscribers<T> {
    pub fn subscribe(&self) -> (Subscription<T>, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.inner.lock().expect("subscriber list lock poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        registry.queues.insert(id, tx);
        let subscription = Subscription {
            inner: self.inner.clone(),
            id,
        };
        (subscription, rx)
    }

    /// Enqueues the payload on every live queue, reaping dead ones.
    pub fn notify(&self, payload: T) {
        let mut registry = self.inner.lock().expect("subscriber list lock poisoned");
        registry
            .queues
            .retain(|_, tx| tx.send(payload.clone()).is_ok());
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                queues: HashMap::new(),
            })),
        }
    }
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.inner
            .lock()
            .expect("subscriber list lock poisoned")
            .queues
            .remove(&self.id);
    }
}
