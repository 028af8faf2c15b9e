use std::sync::{Arc, Mutex};

use smol_str::SmolStr;

use parley_structs::chat::{Authentication, ChatRpcError, InitialRequest, Message, ReceivedMessage};
use parley_structs::replica::ReplicatedMessage;
use parley_structs::timestamp::Timestamp;

use crate::mailbox::Mailboxes;
use crate::peers::PeerRegistry;
use crate::pubsub::Subscribers;
use crate::store::{Store, StoreError};

/// One chat replica: the durable store plus the in-memory fan-out state,
/// shared by the client-facing and peer-facing services.
#[derive(Clone)]
pub struct Node {
    pub identity: SmolStr,
    pub store: Store,
    pub clock: Clock,
    pub mailboxes: Mailboxes,
    pub firehoses: Subscribers<ReplicatedMessage>,
    pub user_updates: Subscribers<InitialRequest>,
    pub peers: PeerRegistry,
}

impl Node {
    pub fn new(identity: impl Into<SmolStr>, store: Store) -> Self {
        Self {
            identity: identity.into(),
            store,
            clock: Clock::default(),
            mailboxes: Mailboxes::default(),
            firehoses: Subscribers::default(),
            user_updates: Subscribers::default(),
            peers: PeerRegistry::default(),
        }
    }

    /// The idempotent write behind both `SendMessage` and the firehose:
    /// appends to the log under the `(from, to, sent)` key and hands the
    /// message to the recipient's local mailbox if one is attached. A
    /// duplicate key means the message is already here, which is success.
    pub async fn message(
        &self,
        from: &str,
        to: &str,
        text: &str,
        sent: Option<Timestamp>,
    ) -> Result<Timestamp, StoreError> {
        let sent = sent.unwrap_or_else(|| self.clock.next());
        match self.store.append_message(from, to, text, &sent).await {
            Ok(()) => {
                self.mailboxes.deliver(
                    to,
                    ReceivedMessage {
                        message: Some(Message {
                            username: from.into(),
                            text: text.into(),
                        }),
                        sent: Some(sent.clone()),
                    },
                );
            }
            Err(StoreError::Duplicate) => {
                tracing::debug!(from, to, sent = %sent, "duplicate message absorbed");
            }
            Err(err) => return Err(err),
        }
        Ok(sent)
    }

    /// Applies one payload from a peer's firehose.
    pub async fn save(&self, replicated: ReplicatedMessage) -> Result<(), StoreError> {
        self.message(
            &replicated.from,
            &replicated.message.username,
            &replicated.message.text,
            Some(replicated.sent),
        )
        .await?;
        Ok(())
    }

    /// Applies an account create or delete, local or replicated. The
    /// caller decides whether a duplicate create is an error (a client
    /// taking a taken name) or a no-op (the merge path).
    pub async fn update_user(&self, update: &InitialRequest) -> Result<(), StoreError> {
        if update.create {
            self.store
                .insert_user(&update.user.username, &update.user.password)
                .await
        } else {
            self.store.delete_user(&update.user.username).await
        }
    }

    /// Fails the call with the client-facing auth error unless the
    /// credentials match the local directory.
    pub async fn authenticate(&self, user: &Authentication) -> Result<(), ChatRpcError> {
        match self.store.exists_user(&user.username, &user.password).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ChatRpcError::InvalidArgument(
                "Incorrect username or password.".into(),
            )),
            Err(err) => Err(crate::fatal_chat_error(err)),
        }
    }
}

/// Issues strictly increasing canonical timestamps. Two sends between the
/// same pair inside one millisecond would otherwise collide on the
/// `(from, to, sent)` key, so calls landing on an already-issued
/// millisecond are bumped to the next one.
#[derive(Clone, Default)]
pub struct Clock {
    last: Arc<Mutex<Option<Timestamp>>>,
}

impl Clock {
    pub fn next(&self) -> Timestamp {
        let mut last = self.last.lock().expect("clock lock poisoned");
        let mut stamp = Timestamp::now();
        if let Some(prev) = last.as_ref() {
            if stamp <= *prev {
                stamp = prev.successor();
            }
        }
        *last = Some(stamp.clone());
        stamp
    }
}
