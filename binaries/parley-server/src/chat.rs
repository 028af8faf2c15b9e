use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_structs::chat::{
    Authentication, ChatProtocol, ChatRpcError, Filter, InitialRequest, Message, ReceivedMessage,
    SentMessage, Users,
};
use parley_structs::replica::ReplicatedMessage;
use parley_structs::username::UserName;

use crate::fatal_chat_error;
use crate::node::Node;
use crate::store::StoreError;

#[async_trait]
impl ChatProtocol for Node {
    async fn v1_initiate(
        &self,
        request: InitialRequest,
    ) -> Result<mpsc::UnboundedReceiver<ReceivedMessage>, ChatRpcError> {
        if UserName::parse(&request.user.username).is_err() {
            return Err(ChatRpcError::InvalidArgument(
                "Username must not contain whitespace or be empty.".into(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if request.create {
            match self.update_user(&request).await {
                Ok(()) => {}
                Err(StoreError::Duplicate) => {
                    return Err(ChatRpcError::AlreadyExists(format!(
                        "Username \"{}\" is not available.",
                        request.user.username
                    )));
                }
                Err(err) => return Err(fatal_chat_error(err)),
            }
            self.user_updates.notify(request.clone());
            let _ = tx.send(ReceivedMessage::heartbeat());
            tracing::info!(user = %request.user.username, "account created");
        } else {
            self.authenticate(&request.user).await?;
            let _ = tx.send(ReceivedMessage::heartbeat());
            // Replay persisted history, offline messages included.
            let history = self
                .store
                .scan_messages_for(&request.user.username)
                .await
                .map_err(fatal_chat_error)?;
            for row in history {
                let _ = tx.send(ReceivedMessage {
                    message: Some(Message {
                        username: row.from,
                        text: row.text,
                    }),
                    sent: Some(row.sent),
                });
            }
            tracing::info!(user = %request.user.username, "logged in");
        }

        let (guard, mut mailbox) = self.mailboxes.install(&request.user.username);
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    frame = mailbox.recv() => match frame {
                        Some(frame) => {
                            if tx.send(frame).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn v1_send_message(&self, request: SentMessage) -> Result<(), ChatRpcError> {
        self.authenticate(&request.user).await?;
        if !self
            .store
            .has_user(&request.message.username)
            .await
            .map_err(fatal_chat_error)?
        {
            return Err(ChatRpcError::InvalidArgument(format!(
                "{} is not a user.",
                request.message.username
            )));
        }
        let sent = self
            .message(
                &request.user.username,
                &request.message.username,
                &request.message.text,
                None,
            )
            .await
            .map_err(fatal_chat_error)?;
        self.firehoses.notify(ReplicatedMessage {
            from: request.user.username.clone(),
            message: request.message,
            sent,
        });
        Ok(())
    }

    async fn v1_delete_account(&self, user: Authentication) -> Result<(), ChatRpcError> {
        self.authenticate(&user).await?;
        let update = InitialRequest {
            create: false,
            user,
        };
        self.update_user(&update).await.map_err(fatal_chat_error)?;
        tracing::info!(user = %update.user.username, "account deleted");
        self.user_updates.notify(update);
        Ok(())
    }

    async fn v1_list_users(&self, filter: Filter) -> Result<Users, ChatRpcError> {
        let usernames = self
            .store
            .list_users(&filter.glob)
            .await
            .map_err(fatal_chat_error)?;
        Ok(Users { usernames })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use parley_structs::chat::{
        Authentication, ChatProtocol, ChatRpcError, Filter, InitialRequest, Message,
        ReceivedMessage, SentMessage,
    };

    use crate::node::Node;
    use crate::store::Store;

    async fn scratch_node() -> (tempfile::TempDir, Node) {
        let dir = tempfile::tempdir().expect("create scratch dir");
        let store = Store::open(&dir.path().join("chat.db"))
            .await
            .expect("open store");
        (dir, Node::new("127.0.0.1:0", store))
    }

    fn auth(username: &str, password: &str) -> Authentication {
        Authentication {
            username: username.into(),
            password: password.into(),
        }
    }

    fn initial(create: bool, username: &str, password: &str) -> InitialRequest {
        InitialRequest {
            create,
            user: auth(username, password),
        }
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<ReceivedMessage>) -> ReceivedMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame before deadline")
            .expect("stream still open")
    }

    async fn send(node: &Node, from: &str, password: &str, to: &str, text: &str) {
        node.v1_send_message(SentMessage {
            message: Message {
                username: to.into(),
                text: text.into(),
            },
            user: auth(from, password),
        })
        .await
        .expect("send message");
    }

    #[tokio::test]
    async fn register_login_roundtrip() {
        let (_dir, node) = scratch_node().await;
        let mut stream = node
            .v1_initiate(initial(true, "Alice", "pw"))
            .await
            .expect("register");
        assert!(next_frame(&mut stream).await.is_heartbeat());
        drop(stream);

        let mut relogin = node
            .v1_initiate(initial(false, "Alice", "pw"))
            .await
            .expect("login");
        assert!(next_frame(&mut relogin).await.is_heartbeat());

        let wrong_password = node.v1_initiate(initial(false, "Alice", "nope")).await;
        assert!(matches!(
            wrong_password,
            Err(ChatRpcError::InvalidArgument(detail))
                if detail == "Incorrect username or password."
        ));

        let unknown_user = node.v1_initiate(initial(false, "Bob", "pw")).await;
        assert!(matches!(
            unknown_user,
            Err(ChatRpcError::InvalidArgument(detail))
                if detail == "Incorrect username or password."
        ));
    }

    #[tokio::test]
    async fn taken_name_is_rejected() {
        let (_dir, node) = scratch_node().await;
        node.v1_initiate(initial(true, "Alice", "pw"))
            .await
            .expect("register");
        let taken = node.v1_initiate(initial(true, "Alice", "other")).await;
        assert!(matches!(
            taken,
            Err(ChatRpcError::AlreadyExists(detail))
                if detail == "Username \"Alice\" is not available."
        ));
    }

    #[tokio::test]
    async fn whitespace_usernames_are_rejected() {
        let (_dir, node) = scratch_node().await;
        for username in ["", "ab cd", "tabbed\tname"] {
            let rejected = node.v1_initiate(initial(true, username, "pw")).await;
            assert!(matches!(
                rejected,
                Err(ChatRpcError::InvalidArgument(detail))
                    if detail == "Username must not contain whitespace or be empty."
            ));
        }
    }

    #[tokio::test]
    async fn live_delivery_preserves_send_order() {
        let (_dir, node) = scratch_node().await;
        let mut alice = node
            .v1_initiate(initial(true, "Alice", "pw"))
            .await
            .expect("register alice");
        let mut bob = node
            .v1_initiate(initial(true, "Bob", "pw"))
            .await
            .expect("register bob");
        assert!(next_frame(&mut alice).await.is_heartbeat());
        assert!(next_frame(&mut bob).await.is_heartbeat());

        send(&node, "Alice", "pw", "Bob", "hi").await;
        let first = next_frame(&mut bob).await;
        let message = first.message.expect("payload");
        assert_eq!(message.username, "Alice");
        assert_eq!(message.text, "hi");
        assert!(first.sent.is_some());

        for text in ["a", "b", "c"] {
            send(&node, "Alice", "pw", "Bob", text).await;
        }
        let mut texts = Vec::new();
        for _ in 0..3 {
            texts.push(next_frame(&mut bob).await.message.expect("payload").text);
        }
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn offline_messages_replay_in_order_after_heartbeat() {
        let (_dir, node) = scratch_node().await;
        let alice = node
            .v1_initiate(initial(true, "Alice", "pw"))
            .await
            .expect("register alice");
        node.v1_initiate(initial(true, "Bob", "pw"))
            .await
            .expect("register bob");
        drop(alice);

        for text in ["one", "two", "three"] {
            send(&node, "Bob", "pw", "Alice", text).await;
        }

        let mut replay = node
            .v1_initiate(initial(false, "Alice", "pw"))
            .await
            .expect("login");
        assert!(next_frame(&mut replay).await.is_heartbeat());
        let mut texts = Vec::new();
        for _ in 0..3 {
            let frame = next_frame(&mut replay).await;
            let message = frame.message.expect("payload");
            assert_eq!(message.username, "Bob");
            texts.push(message.text);
        }
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn login_replays_own_sent_messages_too() {
        let (_dir, node) = scratch_node().await;
        node.v1_initiate(initial(true, "Alice", "pw"))
            .await
            .expect("register alice");
        node.v1_initiate(initial(true, "Bob", "pw"))
            .await
            .expect("register bob");
        send(&node, "Alice", "pw", "Bob", "hi bob").await;

        let mut replay = node
            .v1_initiate(initial(false, "Alice", "pw"))
            .await
            .expect("login");
        assert!(next_frame(&mut replay).await.is_heartbeat());
        let frame = next_frame(&mut replay).await;
        assert_eq!(frame.message.expect("payload").username, "Alice");
    }

    #[tokio::test]
    async fn unknown_recipient_is_rejected() {
        let (_dir, node) = scratch_node().await;
        node.v1_initiate(initial(true, "Alice", "pw"))
            .await
            .expect("register");
        let rejected = node
            .v1_send_message(SentMessage {
                message: Message {
                    username: "Nobody".into(),
                    text: "hello?".into(),
                },
                user: auth("Alice", "pw"),
            })
            .await;
        assert!(matches!(
            rejected,
            Err(ChatRpcError::InvalidArgument(detail)) if detail == "Nobody is not a user."
        ));
    }

    #[tokio::test]
    async fn send_requires_authentication() {
        let (_dir, node) = scratch_node().await;
        node.v1_initiate(initial(true, "Alice", "pw"))
            .await
            .expect("register");
        let denied = node
            .v1_send_message(SentMessage {
                message: Message {
                    username: "Alice".into(),
                    text: "hi".into(),
                },
                user: auth("Alice", "wrong"),
            })
            .await;
        assert!(matches!(denied, Err(ChatRpcError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn glob_listing_filters_names() {
        let (_dir, node) = scratch_node().await;
        for name in ["Alice", "Alvin", "Bob"] {
            node.v1_initiate(initial(true, name, "pw"))
                .await
                .expect("register");
        }
        let mut matched = node
            .v1_list_users(Filter { glob: "Al*".into() })
            .await
            .expect("list")
            .usernames;
        matched.sort();
        assert_eq!(matched, vec!["Alice", "Alvin"]);
        assert_eq!(
            node.v1_list_users(Filter { glob: "*".into() })
                .await
                .expect("list")
                .usernames
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn deleted_account_disappears_and_cannot_log_in() {
        let (_dir, node) = scratch_node().await;
        node.v1_initiate(initial(true, "Alice", "pw"))
            .await
            .expect("register");
        node.v1_delete_account(auth("Alice", "pw"))
            .await
            .expect("delete");

        let listed = node
            .v1_list_users(Filter { glob: "*".into() })
            .await
            .expect("list")
            .usernames;
        assert!(!listed.contains(&"Alice".into()));

        let login = node.v1_initiate(initial(false, "Alice", "pw")).await;
        assert!(matches!(login, Err(ChatRpcError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn latest_session_receives_live_delivery() {
        let (_dir, node) = scratch_node().await;
        node.v1_initiate(initial(true, "Alice", "pw"))
            .await
            .expect("register alice");
        node.v1_initiate(initial(true, "Bob", "pw"))
            .await
            .expect("register bob");

        let mut stale = node
            .v1_initiate(initial(false, "Bob", "pw"))
            .await
            .expect("first login");
        assert!(next_frame(&mut stale).await.is_heartbeat());
        let mut fresh = node
            .v1_initiate(initial(false, "Bob", "pw"))
            .await
            .expect("second login");
        assert!(next_frame(&mut fresh).await.is_heartbeat());

        send(&node, "Alice", "pw", "Bob", "hi").await;
        assert_eq!(
            next_frame(&mut fresh).await.message.expect("payload").text,
            "hi"
        );
        assert!(stale.try_recv().is_err());
    }
}
