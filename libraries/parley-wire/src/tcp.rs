use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_concurrency::future::Race;
use serde_json::Value;
use smol_str::SmolStr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;

use crate::{Frame, REQUEST_TIMEOUT_SECS, Reply, Streaming, WireService};

type CallReply = anyhow::Result<Result<Value, Value>>;
type ItemsTx = mpsc::UnboundedSender<anyhow::Result<Value>>;
type ItemsRx = mpsc::UnboundedReceiver<anyhow::Result<Value>>;
type SubscribeReply = anyhow::Result<Result<ItemsRx, Value>>;

/// Serves a [`WireService`] on an already-bound listener, one connection
/// per task, requests answered concurrently.
pub async fn serve<S: WireService>(listener: TcpListener, service: S) -> anyhow::Result<()> {
    let service = Arc::new(service);
    loop {
        let (stream, addr) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move { handle_connection(service, stream, addr).await });
    }
}

async fn handle_connection<S: WireService>(service: Arc<S>, stream: TcpStream, addr: SocketAddr) {
    let (reader, mut writer) = stream.into_split();
    let (write_tx, mut write_rx) = mpsc::channel::<String>(256);
    tokio::spawn(async move {
        while let Some(line) = write_rx.recv().await {
            let write_line = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                Ok::<(), std::io::Error>(())
            };
            match time::timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), write_line).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return,
            }
        }
    });

    let tasks: Arc<Mutex<HashMap<u64, JoinHandle<()>>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim_end_matches(|c| c == '\n' || c == '\r');
        if trimmed.is_empty() {
            continue;
        }
        let frame = match serde_json::from_str::<Frame>(trimmed) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(peer = %addr, "dropping malformed frame: {err}");
                continue;
            }
        };
        match frame {
            Frame::Request { id, method, params } => {
                let service = service.clone();
                let write_tx = write_tx.clone();
                let tasks_for_cleanup = tasks.clone();
                let handle = tokio::spawn(async move {
                    respond_one(service, write_tx, id, method, params).await;
                    tasks_for_cleanup
                        .lock()
                        .expect("wire task table lock poisoned")
                        .remove(&id);
                });
                tasks
                    .lock()
                    .expect("wire task table lock poisoned")
                    .insert(id, handle);
            }
            Frame::Cancel { id } => {
                if let Some(handle) = tasks
                    .lock()
                    .expect("wire task table lock poisoned")
                    .remove(&id)
                {
                    handle.abort();
                }
            }
            _ => tracing::debug!(peer = %addr, "unexpected frame from client"),
        }
    }
    for (_, handle) in tasks
        .lock()
        .expect("wire task table lock poisoned")
        .drain()
    {
        handle.abort();
    }
}

async fn respond_one<S: WireService>(
    service: Arc<S>,
    write_tx: mpsc::Sender<String>,
    id: u64,
    method: SmolStr,
    params: Value,
) {
    let Some(reply) = service.respond(&method, params).await else {
        send_frame(
            &write_tx,
            &Frame::Response {
                id,
                result: None,
                error: Some(Value::String(format!("unknown method {method}"))),
            },
        )
        .await;
        return;
    };
    match reply {
        Reply::Unary(Ok(result)) => {
            send_frame(
                &write_tx,
                &Frame::Response {
                    id,
                    result: Some(result),
                    error: None,
                },
            )
            .await;
        }
        Reply::Unary(Err(error)) | Reply::Stream(Err(error)) => {
            send_frame(
                &write_tx,
                &Frame::Response {
                    id,
                    result: None,
                    error: Some(error),
                },
            )
            .await;
        }
        Reply::Stream(Ok(mut items)) => {
            let accepted = Frame::Response {
                id,
                result: Some(Value::Null),
                error: None,
            };
            if !send_frame(&write_tx, &accepted).await {
                return;
            }
            loop {
                tokio::select! {
                    _ = write_tx.closed() => return,
                    item = items.recv() => match item {
                        Some(item) => {
                            if !send_frame(&write_tx, &Frame::StreamItem { id, item }).await {
                                return;
                            }
                        }
                        None => {
                            send_frame(&write_tx, &Frame::StreamEnd { id, error: None }).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn send_frame(write_tx: &mpsc::Sender<String>, frame: &Frame) -> bool {
    let Ok(line) = serde_json::to_string(frame) else {
        return false;
    };
    write_tx.send(line).await.is_ok()
}

/// A multiplexing client channel to one address. Connects lazily on the
/// first call and reconnects on the next call after a broken connection;
/// live subscriptions die with the connection that carried them.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::Sender<Command>,
    next_id: Arc<AtomicU64>,
}

impl Transport {
    pub fn new(address: impl Into<SmolStr>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let address = address.into();
        tokio::spawn(async move { run_client(address, cmd_rx).await });
        Self {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A unary call: `Ok(Err(_))` is the service's typed error value,
    /// the outer error is the transport failing.
    pub async fn call(&self, method: &str, params: Value) -> CallReply {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                id,
                method: method.into(),
                params,
                resp_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("transport task stopped"))?;
        match time::timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), resp_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(anyhow::anyhow!("transport task stopped")),
            Err(_) => {
                let _ = self.cmd_tx.send(Command::Cancel { id }).await;
                Err(anyhow::anyhow!("request timeout"))
            }
        }
    }

    /// Opens a server-push stream.
    pub async fn subscribe<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> anyhow::Result<Result<Streaming<T>, Value>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                id,
                method: method.into(),
                params,
                resp_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("transport task stopped"))?;
        match time::timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), resp_rx).await {
            Ok(Ok(reply)) => Ok(reply?.map(Streaming::new)),
            Ok(Err(_)) => Err(anyhow::anyhow!("transport task stopped")),
            Err(_) => {
                let _ = self.cmd_tx.send(Command::Cancel { id }).await;
                Err(anyhow::anyhow!("request timeout"))
            }
        }
    }
}

enum Command {
    Call {
        id: u64,
        method: SmolStr,
        params: Value,
        resp_tx: oneshot::Sender<CallReply>,
    },
    Subscribe {
        id: u64,
        method: SmolStr,
        params: Value,
        resp_tx: oneshot::Sender<SubscribeReply>,
    },
    Cancel {
        id: u64,
    },
}

enum Pending {
    Call(oneshot::Sender<CallReply>),
    Accept(oneshot::Sender<SubscribeReply>),
    Stream(ItemsTx),
}

enum ConnEvent {
    Frame(Frame),
    Closed(anyhow::Error),
}

enum ClientEvent {
    Command(Option<Command>),
    Connection(Option<ConnEvent>),
}

struct Connection {
    write_tx: mpsc::Sender<String>,
    event_rx: mpsc::Receiver<ConnEvent>,
}

impl Connection {
    async fn connect(address: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (reader, mut writer) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::channel::<String>(256);
        let (event_tx, event_rx) = mpsc::channel::<ConnEvent>(256);

        let read_event_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        let _ = read_event_tx
                            .send(ConnEvent::Closed(anyhow::anyhow!("connection closed")))
                            .await;
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim_end_matches(|c| c == '\n' || c == '\r');
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Frame>(trimmed) {
                            Ok(frame) => {
                                if read_event_tx.send(ConnEvent::Frame(frame)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                let _ = read_event_tx
                                    .send(ConnEvent::Closed(anyhow::Error::from(err)))
                                    .await;
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = read_event_tx
                            .send(ConnEvent::Closed(anyhow::Error::from(err)))
                            .await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                let write_line = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    Ok::<(), std::io::Error>(())
                };
                match time::timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), write_line).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        let _ = event_tx
                            .send(ConnEvent::Closed(anyhow::anyhow!("connection closed")))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(Self { write_tx, event_rx })
    }
}

async fn run_client(address: SmolStr, mut cmd_rx: mpsc::Receiver<Command>) {
    let mut connection: Option<Connection> = None;
    let mut pending: HashMap<u64, Pending> = HashMap::new();

    loop {
        let event = if let Some(conn) = connection.as_mut() {
            let cmd_fut = async { ClientEvent::Command(cmd_rx.recv().await) };
            let conn_fut = async { ClientEvent::Connection(conn.event_rx.recv().await) };
            (cmd_fut, conn_fut).race().await
        } else {
            ClientEvent::Command(cmd_rx.recv().await)
        };

        match event {
            ClientEvent::Command(Some(Command::Call {
                id,
                method,
                params,
                resp_tx,
            })) => match enqueue_request(&address, &mut connection, id, method, params).await {
                Ok(()) => {
                    pending.insert(id, Pending::Call(resp_tx));
                }
                Err(err) => {
                    let _ = resp_tx.send(Err(err));
                    if connection.is_none() {
                        fail_pending(&mut pending, "connection closed");
                    }
                }
            },
            ClientEvent::Command(Some(Command::Subscribe {
                id,
                method,
                params,
                resp_tx,
            })) => match enqueue_request(&address, &mut connection, id, method, params).await {
                Ok(()) => {
                    pending.insert(id, Pending::Accept(resp_tx));
                }
                Err(err) => {
                    let _ = resp_tx.send(Err(err));
                    if connection.is_none() {
                        fail_pending(&mut pending, "connection closed");
                    }
                }
            },
            ClientEvent::Command(Some(Command::Cancel { id })) => {
                if pending.remove(&id).is_some() {
                    send_cancel(connection.as_mut(), id).await;
                }
            }
            ClientEvent::Command(None) => {
                fail_pending(&mut pending, "transport dropped");
                return;
            }
            ClientEvent::Connection(Some(ConnEvent::Frame(frame))) => {
                if let Some(cancel_id) = handle_frame(frame, &mut pending) {
                    send_cancel(connection.as_mut(), cancel_id).await;
                }
            }
            ClientEvent::Connection(Some(ConnEvent::Closed(err))) => {
                fail_pending(&mut pending, &err.to_string());
                connection = None;
            }
            ClientEvent::Connection(None) => {
                fail_pending(&mut pending, "connection closed");
                connection = None;
            }
        }
    }
}

async fn enqueue_request(
    address: &str,
    connection: &mut Option<Connection>,
    id: u64,
    method: SmolStr,
    params: Value,
) -> anyhow::Result<()> {
    if connection.is_none() {
        *connection = Some(Connection::connect(address).await?);
    }
    let line = serde_json::to_string(&Frame::Request { id, method, params })?;
    let Some(conn) = connection.as_mut() else {
        anyhow::bail!("connection closed");
    };
    if conn.write_tx.send(line).await.is_err() {
        *connection = None;
        anyhow::bail!("connection closed");
    }
    Ok(())
}

async fn send_cancel(connection: Option<&mut Connection>, id: u64) {
    let Some(conn) = connection else { return };
    if let Ok(line) = serde_json::to_string(&Frame::Cancel { id }) {
        let _ = conn.write_tx.send(line).await;
    }
}

/// Routes one inbound frame to its pending call or stream; returns an id
/// to cancel server-side when the local consumer has already gone away.
fn handle_frame(frame: Frame, pending: &mut HashMap<u64, Pending>) -> Option<u64> {
    match frame {
        Frame::Response { id, result, error } => match pending.remove(&id) {
            Some(Pending::Call(resp_tx)) => {
                let reply = match error {
                    Some(error) => Ok(Err(error)),
                    None => Ok(Ok(result.unwrap_or(Value::Null))),
                };
                let _ = resp_tx.send(reply);
                None
            }
            Some(Pending::Accept(resp_tx)) => match error {
                Some(error) => {
                    let _ = resp_tx.send(Ok(Err(error)));
                    None
                }
                None => {
                    let (items_tx, items_rx) = mpsc::unbounded_channel();
                    if resp_tx.send(Ok(Ok(items_rx))).is_ok() {
                        pending.insert(id, Pending::Stream(items_tx));
                        None
                    } else {
                        Some(id)
                    }
                }
            },
            Some(stream @ Pending::Stream(_)) => {
                pending.insert(id, stream);
                None
            }
            None => None,
        },
        Frame::StreamItem { id, item } => {
            if let Some(Pending::Stream(items_tx)) = pending.get(&id) {
                if items_tx.send(Ok(item)).is_err() {
                    pending.remove(&id);
                    return Some(id);
                }
            }
            None
        }
        Frame::StreamEnd { id, error } => {
            match pending.remove(&id) {
                Some(Pending::Stream(items_tx)) => {
                    if let Some(error) = error {
                        let _ = items_tx.send(Err(anyhow::anyhow!("stream failed: {error}")));
                    }
                }
                Some(Pending::Accept(resp_tx)) => {
                    let _ = resp_tx.send(Ok(Err(error.unwrap_or(Value::Null))));
                }
                Some(Pending::Call(resp_tx)) => {
                    let _ = resp_tx.send(Err(anyhow::anyhow!("unexpected stream end")));
                }
                None => {}
            }
            None
        }
        Frame::Request { .. } | Frame::Cancel { .. } => None,
    }
}

fn fail_pending(pending: &mut HashMap<u64, Pending>, message: &str) {
    for (_, entry) in pending.drain() {
        match entry {
            Pending::Call(resp_tx) => {
                let _ = resp_tx.send(Err(anyhow::anyhow!(message.to_string())));
            }
            Pending::Accept(resp_tx) => {
                let _ = resp_tx.send(Err(anyhow::anyhow!(message.to_string())));
            }
            Pending::Stream(items_tx) => {
                let _ = items_tx.send(Err(anyhow::anyhow!(message.to_string())));
            }
        }
    }
}
