use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use smol_str::SmolStr;

use parley_wire::Transport;

type Table = Arc<Mutex<HashMap<SmolStr, PeerEntry>>>;

/// The cluster membership table: one shared outbound channel per peer
/// address, kept while at least one stream in either direction is using
/// it.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Table,
}

struct PeerEntry {
    transport: Transport,
    streams: usize,
}

/// Pins a peer's membership; the peer (and its channel) is dropped from
/// the table when the last guard goes.
pub struct PeerGuard {
    inner: Table,
    address: SmolStr,
    transport: Transport,
}

impl PeerRegistry {
    /// Fetches the peer's outbound channel, dialing it on first contact.
    pub fn attach(&self, address: &SmolStr) -> PeerGuard {
        let mut table = self.inner.lock().expect("peer registry lock poisoned");
        let entry = table.entry(address.clone()).or_insert_with(|| {
            tracing::info!(peer = %address, "replica connected");
            PeerEntry {
                transport: Transport::new(address.clone()),
                streams: 0,
            }
        });
        entry.streams += 1;
        PeerGuard {
            inner: self.inner.clone(),
            address: address.clone(),
            transport: entry.transport.clone(),
        }
    }

    pub fn addresses(&self) -> Vec<SmolStr> {
        self.inner
            .lock()
            .expect("peer registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl PeerGuard {
    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        let mut table = self.inner.lock().expect("peer registry lock poisoned");
        if let Some(entry) = table.get_mut(&self.address) {
            entry.streams -= 1;
            if entry.streams == 0 {
                table.remove(&self.address);
                tracing::info!(peer = %self.address, "replica disconnected");
            }
        }
    }
}
