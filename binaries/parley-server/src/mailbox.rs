use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use smol_str::SmolStr;
use tokio::sync::mpsc;

use parley_structs::chat::ReceivedMessage;

type Table = Arc<Mutex<HashMap<SmolStr, mpsc::UnboundedSender<ReceivedMessage>>>>;

/// Live delivery queues for the clients attached to this replica.
///
/// One unbounded queue per streaming session. A later session for the
/// same user replaces the earlier one, and teardown only removes the
/// entry if it still belongs to the departing session.
#[derive(Clone, Default)]
pub struct Mailboxes {
    inner: Table,
}

/// Removes the owning session's mailbox when dropped.
pub struct MailboxGuard {
    inner: Table,
    name: SmolStr,
    sender: mpsc::UnboundedSender<ReceivedMessage>,
}

impl Mailboxes {
    pub fn install(&self, name: &SmolStr) -> (MailboxGuard, mpsc::UnboundedReceiver<ReceivedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("mailbox table lock poisoned")
            .insert(name.clone(), tx.clone());
        let guard = MailboxGuard {
            inner: self.inner.clone(),
            name: name.clone(),
            sender: tx,
        };
        (guard, rx)
    }

    /// Enqueues without blocking; quietly drops the frame when the
    /// recipient has no mailbox here. They are offline or attached to
    /// another replica, and will pick the message up from the log.
    pub fn deliver(&self, to: &str, frame: ReceivedMessage) {
        let table = self.inner.lock().expect("mailbox table lock poisoned");
        if let Some(tx) = table.get(to) {
            let _ = tx.send(frame);
        }
    }
}

impl Drop for MailboxGuard {
    fn drop(&mut self) {
        let mut table = self.inner.lock().expect("mailbox table lock poisoned");
        if table
            .get(&self.name)
            .is_some_and(|tx| tx.same_channel(&self.sender))
        {
            table.remove(&self.name);
        }
    }
}
