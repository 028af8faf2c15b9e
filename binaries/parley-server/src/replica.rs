use async_trait::async_trait;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use parley_structs::chat::{Authentication, InitialRequest, Message};
use parley_structs::replica::{
    Peer, Peers, ReplicaClient, ReplicaProtocol, ReplicaRpcError, ReplicatedMessage,
};

use crate::fatal_replica_error;
use crate::node::Node;
use crate::store::StoreError;

#[async_trait]
impl ReplicaProtocol for Node {
    async fn v1_cluster(&self) -> Result<Peers, ReplicaRpcError> {
        Ok(Peers {
            peers: self.peers.addresses(),
        })
    }

    async fn v1_firehose(
        &self,
        peer: Peer,
    ) -> Result<mpsc::UnboundedReceiver<ReplicatedMessage>, ReplicaRpcError> {
        let guard = self.peers.attach(&peer.address);
        // Subscribe before snapshotting: anything accepted mid-transfer
        // shows up at least once, and the unique-key merge absorbs the
        // overlap.
        let (subscription, mut queue) = self.firehoses.subscribe();
        let log = self.store.scan_messages().await.map_err(fatal_replica_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let node = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _subscription = subscription;
            for row in log {
                let payload = ReplicatedMessage {
                    message: Message {
                        username: row.to,
                        text: row.text,
                    },
                    from: row.from,
                    sent: row.sent,
                };
                if tx.send(payload).is_err() {
                    return;
                }
            }
            if peer.new {
                // Subscribe back so the peer's own state flows to us;
                // new=false stops the reciprocation there.
                let back = node.clone();
                let address = peer.address.clone();
                tokio::spawn(async move { back.consume_firehose(address, false).await });
            }
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    payload = queue.recv() => match payload {
                        Some(payload) => {
                            if tx.send(payload).is_err() {
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

    async fn v1_user_update(
        &self,
        peer: Peer,
    ) -> Result<mpsc::UnboundedReceiver<InitialRequest>, ReplicaRpcError> {
        let guard = self.peers.attach(&peer.address);
        let (subscription, mut queue) = self.user_updates.subscribe();
        let users = self.store.scan_users().await.map_err(fatal_replica_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let node = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _subscription = subscription;
            for (username, password) in users {
                let payload = InitialRequest {
                    create: true,
                    user: Authentication { username, password },
                };
                if tx.send(payload).is_err() {
                    return;
                }
            }
            if peer.new {
                let back = node.clone();
                let address = peer.address.clone();
                tokio::spawn(async move { back.consume_user_updates(address, false).await });
            }
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    payload = queue.recv() => match payload {
                        Some(payload) => {
                            if tx.send(payload).is_err() {
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
}

impl Node {
    /// Joins an existing cluster: learn its membership from the bootstrap
    /// peer, then subscribe to everything it and its peers publish.
    pub async fn bootstrap(&self, cluster: &str) -> anyhow::Result<()> {
        let address = SmolStr::new(cluster);
        let peers = {
            let guard = self.peers.attach(&address);
            let client = ReplicaClient(guard.transport().clone());
            client
                .v1_cluster()
                .await?
                .map_err(|err| anyhow::anyhow!("cluster listing refused: {err}"))?
        };
        for peer in peers.peers {
            self.outreach(peer);
        }
        self.outreach(address);
        Ok(())
    }

    /// Opens both replication subscriptions to one peer.
    pub fn outreach(&self, address: SmolStr) {
        if address == self.identity {
            return;
        }
        tracing::info!(peer = %address, "reaching out");
        tokio::spawn(self.clone().consume_firehose(address.clone(), true));
        tokio::spawn(self.clone().consume_user_updates(address, true));
    }

    /// Subscribes to a peer's firehose and merges everything it sends,
    /// state transfer and live traffic alike. Returns when the stream
    /// dies; reconnection is the operator's business.
    pub async fn consume_firehose(self, address: SmolStr, new: bool) {
        let guard = self.peers.attach(&address);
        let client = ReplicaClient(guard.transport().clone());
        let request = Peer {
            new,
            address: self.identity.clone(),
        };
        let mut stream = match client.v1_firehose(&request).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::error!(peer = %address, "firehose refused: {err}");
                return;
            }
            Err(err) => {
                tracing::error!(peer = %address, "firehose failed: {err}");
                return;
            }
        };
        loop {
            match stream.next().await {
                Ok(Some(replicated)) => {
                    if let Err(err) = self.save(replicated).await {
                        tracing::error!(peer = %address, "could not apply replicated message: {err}");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(peer = %address, "firehose ended: {err}");
                    break;
                }
            }
        }
    }

    /// Subscribes to a peer's user updates and folds them into the local
    /// directory; replays of already-known accounts are no-ops.
    pub async fn consume_user_updates(self, address: SmolStr, new: bool) {
        let guard = self.peers.attach(&address);
        let client = ReplicaClient(guard.transport().clone());
        let request = Peer {
            new,
            address: self.identity.clone(),
        };
        let mut stream = match client.v1_user_update(&request).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::error!(peer = %address, "user updates refused: {err}");
                return;
            }
            Err(err) => {
                tracing::error!(peer = %address, "user updates failed: {err}");
                return;
            }
        };
        loop {
            match stream.next().await {
                Ok(Some(update)) => match self.update_user(&update).await {
                    Ok(()) | Err(StoreError::Duplicate) => {}
                    Err(err) => {
                        tracing::error!(peer = %address, "could not apply user update: {err}");
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(peer = %address, "user updates ended: {err}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    use parley_structs::chat::{
        Authentication, ChatProtocol, Filter, InitialRequest, Message, SentMessage,
    };
    use parley_structs::replica::{ReplicaProtocol, ReplicaService};
    use parley_wire::serve;

    use crate::node::Node;
    use crate::store::Store;

    struct TestReplica {
        node: Node,
        server: JoinHandle<anyhow::Result<()>>,
    }

    async fn start_replica(db: &Path) -> TestReplica {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr").to_string();
        let store = Store::open(db).await.expect("open store");
        let node = Node::new(address.as_str(), store);
        let server = tokio::spawn(serve(listener, ReplicaService(node.clone())));
        TestReplica { node, server }
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) -> bool {
        for _ in 0..400 {
            if check().await {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        false
    }

    fn initial(create: bool, username: &str, password: &str) -> InitialRequest {
        InitialRequest {
            create,
            user: Authentication {
                username: username.into(),
                password: password.into(),
            },
        }
    }

    async fn register(node: &Node, username: &str) {
        let mut stream = node
            .v1_initiate(initial(true, username, "pw"))
            .await
            .expect("register");
        assert!(
            timeout(Duration::from_secs(5), stream.recv())
                .await
                .expect("heartbeat before deadline")
                .expect("stream open")
                .is_heartbeat()
        );
    }

    async fn send(node: &Node, from: &str, to: &str, text: &str) {
        node.v1_send_message(SentMessage {
            message: Message {
                username: to.into(),
                text: text.into(),
            },
            user: Authentication {
                username: from.into(),
                password: "pw".into(),
            },
        })
        .await
        .expect("send message");
    }

    async fn sorted_users(node: &Node) -> Vec<String> {
        let mut names: Vec<String> = node
            .v1_list_users(Filter { glob: "*".into() })
            .await
            .expect("list users")
            .usernames
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn two_replicas_converge_and_deliver_across_the_cluster() {
        let dir = tempfile::tempdir().expect("scratch");
        let r1 = start_replica(&dir.path().join("r1.db")).await;
        let r2 = start_replica(&dir.path().join("r2.db")).await;
        r2.node
            .bootstrap(r1.node.identity.as_str())
            .await
            .expect("bootstrap");

        register(&r1.node, "Alice").await;
        let mut bob = r2
            .node
            .v1_initiate(initial(true, "Bob", "pw"))
            .await
            .expect("register bob");
        assert!(
            timeout(Duration::from_secs(5), bob.recv())
                .await
                .expect("heartbeat before deadline")
                .expect("stream open")
                .is_heartbeat()
        );

        assert!(
            eventually(async || {
                r1.node.store.has_user("Bob").await.unwrap_or(false)
                    && r2.node.store.has_user("Alice").await.unwrap_or(false)
            })
            .await
        );

        // Sender on one replica, recipient streaming on the other.
        send(&r1.node, "Alice", "Bob", "over here").await;
        let frame = timeout(Duration::from_secs(5), bob.recv())
            .await
            .expect("delivery before deadline")
            .expect("stream open");
        let message = frame.message.expect("payload");
        assert_eq!(message.username, "Alice");
        assert_eq!(message.text, "over here");

        assert!(
            eventually(async || {
                let log1 = r1.node.store.scan_messages().await.unwrap_or_default();
                let log2 = r2.node.store.scan_messages().await.unwrap_or_default();
                log1.len() == 1 && log1 == log2
            })
            .await
        );

        assert_eq!(sorted_users(&r1.node).await, vec!["Alice", "Bob"]);
        assert_eq!(sorted_users(&r2.node).await, vec!["Alice", "Bob"]);
    }

    #[tokio::test]
    async fn bootstrap_pulls_existing_state_both_ways() {
        let dir = tempfile::tempdir().expect("scratch");
        let r1 = start_replica(&dir.path().join("r1.db")).await;
        let r2 = start_replica(&dir.path().join("r2.db")).await;

        register(&r1.node, "Alice").await;
        register(&r1.node, "Carol").await;
        send(&r1.node, "Alice", "Carol", "pre-join traffic").await;
        register(&r2.node, "Bob").await;

        r2.node
            .bootstrap(r1.node.identity.as_str())
            .await
            .expect("bootstrap");

        assert!(
            eventually(async || {
                sorted_users(&r2.node).await == vec!["Alice", "Bob", "Carol"]
                    && sorted_users(&r1.node).await == vec!["Alice", "Bob", "Carol"]
            })
            .await
        );
        assert!(
            eventually(async || {
                let log2 = r2.node.store.scan_messages().await.unwrap_or_default();
                log2.len() == 1 && log2[0].text == "pre-join traffic"
            })
            .await
        );
    }

    #[tokio::test]
    async fn cluster_reports_attached_peers() {
        let dir = tempfile::tempdir().expect("scratch");
        let r1 = start_replica(&dir.path().join("r1.db")).await;
        let r2 = start_replica(&dir.path().join("r2.db")).await;
        r2.node
            .bootstrap(r1.node.identity.as_str())
            .await
            .expect("bootstrap");

        assert!(
            eventually(async || {
                let on_r1 = r1.node.v1_cluster().await.expect("cluster").peers;
                let on_r2 = r2.node.v1_cluster().await.expect("cluster").peers;
                on_r1.contains(&r2.node.identity) && on_r2.contains(&r1.node.identity)
            })
            .await
        );
    }

    #[tokio::test]
    async fn account_deletion_propagates() {
        let dir = tempfile::tempdir().expect("scratch");
        let r1 = start_replica(&dir.path().join("r1.db")).await;
        let r2 = start_replica(&dir.path().join("r2.db")).await;
        r2.node
            .bootstrap(r1.node.identity.as_str())
            .await
            .expect("bootstrap");

        register(&r1.node, "Alice").await;
        assert!(
            eventually(async || r2.node.store.has_user("Alice").await.unwrap_or(false)).await
        );

        r1.node
            .v1_delete_account(Authentication {
                username: "Alice".into(),
                password: "pw".into(),
            })
            .await
            .expect("delete");
        assert!(
            eventually(async || !r2.node.store.has_user("Alice").await.unwrap_or(true)).await
        );
        assert!(sorted_users(&r2.node).await.is_empty());
    }

    #[tokio::test]
    async fn restarted_replica_reconverges_from_its_database() {
        let dir = tempfile::tempdir().expect("scratch");
        let r1 = start_replica(&dir.path().join("r1.db")).await;
        let r2 = start_replica(&dir.path().join("r2.db")).await;
        r2.node
            .bootstrap(r1.node.identity.as_str())
            .await
            .expect("bootstrap");

        register(&r1.node, "Alice").await;
        register(&r2.node, "Bob").await;
        assert!(
            eventually(async || {
                r1.node.store.has_user("Bob").await.unwrap_or(false)
                    && r2.node.store.has_user("Alice").await.unwrap_or(false)
            })
            .await
        );
        send(&r1.node, "Alice", "Bob", "first").await;
        assert!(
            eventually(async || {
                r2.node.store.scan_messages().await.unwrap_or_default().len() == 1
            })
            .await
        );

        // Fail-stop the peer, then keep talking without it.
        r2.server.abort();
        send(&r1.node, "Alice", "Bob", "while you were away").await;

        // Restart against the same database file and rebootstrap.
        let restarted = start_replica(&dir.path().join("r2.db")).await;
        restarted
            .node
            .bootstrap(r1.node.identity.as_str())
            .await
            .expect("rebootstrap");

        assert!(
            eventually(async || {
                let log1 = r1.node.store.scan_messages().await.unwrap_or_default();
                let log2 = restarted.node.store.scan_messages().await.unwrap_or_default();
                log1.len() == 2 && log1 == log2
            })
            .await
        );

        // Bob logs into the restarted replica and sees his history.
        let mut replay = restarted
            .node
            .v1_initiate(initial(false, "Bob", "pw"))
            .await
            .expect("login");
        assert!(
            timeout(Duration::from_secs(5), replay.recv())
                .await
                .expect("heartbeat before deadline")
                .expect("stream open")
                .is_heartbeat()
        );
        let mut texts = Vec::new();
        for _ in 0..2 {
            let frame = timeout(Duration::from_secs(5), replay.recv())
                .await
                .expect("replay before deadline")
                .expect("stream open");
            texts.push(frame.message.expect("payload").text);
        }
        assert_eq!(texts, vec!["first", "while you were away"]);
    }
}

