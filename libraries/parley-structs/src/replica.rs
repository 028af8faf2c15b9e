use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use thiserror::Error;
use tokio::sync::mpsc;

use parley_wire::{Reply, Streaming, Transport, WireService, forward_stream};

use crate::chat::{InitialRequest, Message};
use crate::timestamp::Timestamp;
use crate::{decode_error, decode_params, encode_error, unary};

/// A message fanned out to peers: the origin user, the payload, and the
/// origin-assigned send time that keys the message everywhere.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedMessage {
    pub message: Message,
    pub from: SmolStr,
    pub sent: Timestamp,
}

/// Identifies the caller of a peer-facing stream. `new` is true on the
/// initiating side only, which is what stops subscription cycles.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub new: bool,
    pub address: SmolStr,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Peers {
    pub peers: Vec<SmolStr>,
}

/// The RPC protocol replicas serve to each other.
#[async_trait]
pub trait ReplicaProtocol {
    /// Reports the addresses of the peers this replica currently knows.
    async fn v1_cluster(&self) -> Result<Peers, ReplicaRpcError>;

    /// Streams the full message log in send order, then every message
    /// this replica subsequently accepts.
    async fn v1_firehose(
        &self,
        peer: Peer,
    ) -> Result<mpsc::UnboundedReceiver<ReplicatedMessage>, ReplicaRpcError>;

    /// Streams the full user table, then every subsequent account create
    /// or delete.
    async fn v1_user_update(
        &self,
        peer: Peer,
    ) -> Result<mpsc::UnboundedReceiver<InitialRequest>, ReplicaRpcError>;
}

/// An error from the replica surface, serialized across the wire.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaRpcError {
    #[error("{0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Adapts a [`ReplicaProtocol`] implementation to the wire layer.
pub struct ReplicaService<T>(pub T);

#[async_trait]
impl<T: ReplicaProtocol + Send + Sync + 'static> WireService for ReplicaService<T> {
    async fn respond(&self, method: &str, params: Value) -> Option<Reply> {
        match method {
            "v1_cluster" => Some(unary(self.0.v1_cluster().await)),
            "v1_firehose" => Some(
                match decode_params::<Peer, _>(params, ReplicaRpcError::BadRequest) {
                    Ok(peer) => match self.0.v1_firehose(peer).await {
                        Ok(items) => Reply::Stream(Ok(forward_stream(items))),
                        Err(error) => Reply::Stream(Err(encode_error(&error))),
                    },
                    Err(error) => Reply::Stream(Err(error)),
                },
            ),
            "v1_user_update" => Some(
                match decode_params::<Peer, _>(params, ReplicaRpcError::BadRequest) {
                    Ok(peer) => match self.0.v1_user_update(peer).await {
                        Ok(items) => Reply::Stream(Ok(forward_stream(items))),
                        Err(error) => Reply::Stream(Err(encode_error(&error))),
                    },
                    Err(error) => Reply::Stream(Err(error)),
                },
            ),
            _ => None,
        }
    }
}

/// A typed replica client over a wire transport.
#[derive(Clone)]
pub struct ReplicaClient(pub Transport);

impl ReplicaClient {
    pub async fn v1_cluster(&self) -> anyhow::Result<Result<Peers, ReplicaRpcError>> {
        match self.0.call("v1_cluster", Value::Null).await? {
            Ok(value) => Ok(Ok(serde_json::from_value(value)?)),
            Err(error) => Ok(Err(decode_error(error)?)),
        }
    }

    pub async fn v1_firehose(
        &self,
        peer: &Peer,
    ) -> anyhow::Result<Result<Streaming<ReplicatedMessage>, ReplicaRpcError>> {
        match self
            .0
            .subscribe("v1_firehose", serde_json::to_value(peer)?)
            .await?
        {
            Ok(stream) => Ok(Ok(stream)),
            Err(error) => Ok(Err(decode_error(error)?)),
        }
    }

    pub async fn v1_user_update(
        &self,
        peer: &Peer,
    ) -> anyhow::Result<Result<Streaming<InitialRequest>, ReplicaRpcError>> {
        match self
            .0
            .subscribe("v1_user_update", serde_json::to_value(peer)?)
            .await?
        {
            Ok(stream) => Ok(Ok(stream)),
            Err(error) => Ok(Err(decode_error(error)?)),
        }
    }
}
