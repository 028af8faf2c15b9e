use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use thiserror::Error;
use tokio::sync::mpsc;

use parley_wire::{Reply, Streaming, Transport, WireService, forward_stream};

use crate::timestamp::Timestamp;
use crate::{decode_error, decode_params, encode_error, unary};

/// A chat message as clients see it: the counterparty and the text. On
/// send the username names the recipient; on delivery it names the sender.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub username: SmolStr,
    pub text: String,
}

/// Clear-text credentials, presented on every client call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    pub username: SmolStr,
    pub password: String,
}

/// Opens a session: registers a new account or logs into an existing one.
/// Doubles as the payload replicated on the user-update stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InitialRequest {
    pub create: bool,
    pub user: Authentication,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message: Message,
    pub user: Authentication,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub glob: SmolStr,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Users {
    pub usernames: Vec<SmolStr>,
}

/// One frame pushed down an `initiate` stream. The empty frame is the
/// heartbeat that tells the client its registration or login went through.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceivedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<Timestamp>,
}

impl ReceivedMessage {
    pub fn heartbeat() -> Self {
        Self::default()
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message.is_none() && self.sent.is_none()
    }
}

/// The RPC protocol served to chat clients.
#[async_trait]
pub trait ChatProtocol {
    /// Registers or authenticates, then streams deliveries: a heartbeat,
    /// the stored history on login, then live messages until the client
    /// goes away.
    async fn v1_initiate(
        &self,
        request: InitialRequest,
    ) -> Result<mpsc::UnboundedReceiver<ReceivedMessage>, ChatRpcError>;

    /// Stores a message and delivers it to the recipient, here or on
    /// whichever replica they are attached to.
    async fn v1_send_message(&self, request: SentMessage) -> Result<(), ChatRpcError>;

    /// Removes the caller's account and their message history.
    async fn v1_delete_account(&self, user: Authentication) -> Result<(), ChatRpcError>;

    /// The locally-known usernames matching a shell-style glob.
    async fn v1_list_users(&self, filter: Filter) -> Result<Users, ChatRpcError>;
}

/// An error from the chat surface, serialized across the wire.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRpcError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Adapts a [`ChatProtocol`] implementation to the wire layer.
pub struct ChatService<T>(pub T);

#[async_trait]
impl<T: ChatProtocol + Send + Sync + 'static> WireService for ChatService<T> {
    async fn respond(&self, method: &str, params: Value) -> Option<Reply> {
        match method {
            "v1_initiate" => Some(
                match decode_params::<InitialRequest, _>(params, ChatRpcError::InvalidArgument) {
                    Ok(request) => match self.0.v1_initiate(request).await {
                        Ok(items) => Reply::Stream(Ok(forward_stream(items))),
                        Err(error) => Reply::Stream(Err(encode_error(&error))),
                    },
                    Err(error) => Reply::Stream(Err(error)),
                },
            ),
            "v1_send_message" => Some(
                match decode_params::<SentMessage, _>(params, ChatRpcError::InvalidArgument) {
                    Ok(request) => unary(self.0.v1_send_message(request).await),
                    Err(error) => Reply::Unary(Err(error)),
                },
            ),
            "v1_delete_account" => Some(
                match decode_params::<Authentication, _>(params, ChatRpcError::InvalidArgument) {
                    Ok(user) => unary(self.0.v1_delete_account(user).await),
                    Err(error) => Reply::Unary(Err(error)),
                },
            ),
            "v1_list_users" => Some(
                match decode_params::<Filter, _>(params, ChatRpcError::InvalidArgument) {
                    Ok(filter) => unary(self.0.v1_list_users(filter).await),
                    Err(error) => Reply::Unary(Err(error)),
                },
            ),
            _ => None,
        }
    }
}

/// A typed chat client over a wire transport.
#[derive(Clone)]
pub struct ChatClient(pub Transport);

impl ChatClient {
    pub async fn v1_initiate(
        &self,
        request: &InitialRequest,
    ) -> anyhow::Result<Result<Streaming<ReceivedMessage>, ChatRpcError>> {
        match self
            .0
            .subscribe("v1_initiate", serde_json::to_value(request)?)
            .await?
        {
            Ok(stream) => Ok(Ok(stream)),
            Err(error) => Ok(Err(decode_error(error)?)),
        }
    }

    pub async fn v1_send_message(
        &self,
        request: &SentMessage,
    ) -> anyhow::Result<Result<(), ChatRpcError>> {
        match self
            .0
            .call("v1_send_message", serde_json::to_value(request)?)
            .await?
        {
            Ok(_) => Ok(Ok(())),
            Err(error) => Ok(Err(decode_error(error)?)),
        }
    }

    pub async fn v1_delete_account(
        &self,
        user: &Authentication,
    ) -> anyhow::Result<Result<(), ChatRpcError>> {
        match self
            .0
            .call("v1_delete_account", serde_json::to_value(user)?)
            .await?
        {
            Ok(_) => Ok(Ok(())),
            Err(error) => Ok(Err(decode_error(error)?)),
        }
    }

    pub async fn v1_list_users(
        &self,
        filter: &Filter,
    ) -> anyhow::Result<Result<Users, ChatRpcError>> {
        match self
            .0
            .call("v1_list_users", serde_json::to_value(filter)?)
            .await?
        {
            Ok(value) => Ok(Ok(serde_json::from_value(value)?)),
            Err(error) => Ok(Err(decode_error(error)?)),
        }
    }
}
