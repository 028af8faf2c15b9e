use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use tokio::sync::mpsc;

mod tcp;

pub use tcp::{Transport, serve};

pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 600;

/// One newline-delimited JSON frame on a connection.
///
/// A unary call is `Request` then `Response`. A streaming call is
/// `Request`, a `Response` accepting (`result: null`) or refusing
/// (`error`), then any number of `StreamItem`s closed by one `StreamEnd`.
/// `Cancel` tears down the server side of a call early.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        method: SmolStr,
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    StreamItem {
        id: u64,
        item: Value,
    },
    StreamEnd {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    Cancel {
        id: u64,
    },
}

/// A service's reply to one request. Error values are the JSON encoding
/// of whatever typed error the protocol layer defines.
pub enum Reply {
    Unary(Result<Value, Value>),
    Stream(Result<mpsc::UnboundedReceiver<Value>, Value>),
}

/// Anything that can answer requests on a listening socket.
#[async_trait]
pub trait WireService: Send + Sync + 'static {
    /// Dispatches one request. `None` means the method is unknown.
    async fn respond(&self, method: &str, params: Value) -> Option<Reply>;
}

/// The receiving half of a server-push stream, decoded item by item.
pub struct Streaming<T> {
    items_rx: mpsc::UnboundedReceiver<anyhow::Result<Value>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Streaming<T> {
    pub(crate) fn new(items_rx: mpsc::UnboundedReceiver<anyhow::Result<Value>>) -> Self {
        Self {
            items_rx,
            _marker: PhantomData,
        }
    }

    /// Waits for the next item; `None` once the server ends the stream.
    pub async fn next(&mut self) -> anyhow::Result<Option<T>> {
        match self.items_rx.recv().await {
            Some(Ok(item)) => Ok(Some(serde_json::from_value(item)?)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

/// Bridges a typed item queue onto the wire layer's JSON item queue,
/// dropping the typed side as soon as the consumer goes away.
pub fn forward_stream<T: Serialize + Send + 'static>(
    mut items: mpsc::UnboundedReceiver<T>,
) -> mpsc::UnboundedReceiver<Value> {
    let (tx, out) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                item = items.recv() => {
                    let Some(item) = item else { break };
                    let Ok(value) = serde_json::to_value(&item) else { break };
                    if tx.send(value).is_err() {
                        break;
                    }
                }
            }
        }
    });
    out
}
