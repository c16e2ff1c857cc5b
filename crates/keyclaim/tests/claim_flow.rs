//! end-to-end claim flow scenarios over in-process doubles

use keyclaim::network::{
    BlockRef, ExecuteRequest, HandshakeRequest, HandshakeResponse, NodeChallenge, NodePartial,
    NodeSessionGrant, NodeSessionRequest, RecordDelegationRequest, SessionChallengeRequest,
};
use keyclaim::{
    AuthMethod, AuthMethodScope, ClaimConfig, ClaimFlow, ClaimResult, ClaimState,
    ConnectionState, Error, Identity, ManagedKeyRecord, NetworkClient, NetworkConfig,
    NodeTransport, Registry, TransactionHandle,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SECRET: [u8; 32] = [42u8; 32];

/// node network double with per-node induced failures
#[derive(Default)]
struct MockNet {
    /// nodes that never answer the connect handshake
    silent_handshake: Vec<String>,
    /// nodes that never answer an execute call
    silent_execute: Vec<String>,
    /// nodes that refuse to grant a session
    refuse_session: Vec<String>,
    /// derived key id per node, defaults to "abc123"
    derived: HashMap<String, String>,
    /// first N execute calls fail with a transport error
    execute_failures: AtomicUsize,
    challenges: AtomicUsize,
    executes: AtomicUsize,
    byes: AtomicUsize,
}

impl MockNet {
    fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait::async_trait]
impl NodeTransport for MockNet {
    async fn handshake(
        &self,
        node: &keyclaim::NodeEndpoint,
        _req: &HandshakeRequest,
    ) -> keyclaim::Result<HandshakeResponse> {
        if self.silent_handshake.contains(&node.id) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(HandshakeResponse {
            node_id: node.id.clone(),
            latest_block: BlockRef { height: 500, hash: "0x5005".into() },
        })
    }

    async fn session_challenge(
        &self,
        node: &keyclaim::NodeEndpoint,
        req: &SessionChallengeRequest,
    ) -> keyclaim::Result<NodeChallenge> {
        self.challenges.fetch_add(1, Ordering::SeqCst);
        Ok(NodeChallenge {
            node_id: node.id.clone(),
            node_nonce: format!("nonce-{}", node.id),
            uri: req.uri.clone(),
        })
    }

    async fn negotiate_session(
        &self,
        node: &keyclaim::NodeEndpoint,
        req: &NodeSessionRequest,
    ) -> keyclaim::Result<NodeSessionGrant> {
        if self.refuse_session.contains(&node.id) {
            return Err(Error::Transport("session refused".into()));
        }
        req.auth_sig.verify()?;
        Ok(NodeSessionGrant {
            node_id: node.id.clone(),
            granted: req.resources.clone(),
            payload: format!("payload-{}", node.id),
            signature: "0xfeed".into(),
        })
    }

    async fn record_delegation(
        &self,
        _node: &keyclaim::NodeEndpoint,
        _req: &RecordDelegationRequest,
    ) -> keyclaim::Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        node: &keyclaim::NodeEndpoint,
        _req: &ExecuteRequest,
    ) -> keyclaim::Result<NodePartial> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        if self.silent_execute.contains(&node.id) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self
            .execute_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Transport("node busy".into()));
        }
        Ok(NodePartial {
            node_id: node.id.clone(),
            derived_key_id: self.derived.get(&node.id).cloned().unwrap_or_else(|| "abc123".into()),
            signature: format!("0xshare-{}", node.id),
        })
    }

    async fn bye(&self, _node: &keyclaim::NodeEndpoint) {
        self.byes.fetch_add(1, Ordering::SeqCst);
    }
}

/// registry double recording what was bound
struct MockRegistry {
    reject_finalize: bool,
    mints: AtomicUsize,
    finalizes: AtomicUsize,
    bound: Mutex<Option<(String, AuthMethod, Vec<AuthMethodScope>)>>,
}

impl MockRegistry {
    fn new() -> Self {
        Self {
            reject_finalize: false,
            mints: AtomicUsize::new(0),
            finalizes: AtomicUsize::new(0),
            bound: Mutex::new(None),
        }
    }

    fn rejecting() -> Self {
        Self { reject_finalize: true, ..Self::new() }
    }

    fn sample_record() -> ManagedKeyRecord {
        use k256::elliptic_curve::sec1::ToEncodedPoint;
        let signing = k256::ecdsa::SigningKey::from_slice(&[77u8; 32]).unwrap();
        let point = signing.verifying_key().to_encoded_point(false);
        let public_key = format!("0x{}", hex::encode(point.as_bytes()));
        let address = keyclaim::identity::address_for_public_key(&public_key)
            .unwrap()
            .to_hex();
        ManagedKeyRecord { token_id: "9001".into(), public_key, address }
    }
}

#[async_trait::async_trait]
impl Registry for MockRegistry {
    async fn mint_managed_key(&self) -> keyclaim::Result<ManagedKeyRecord> {
        self.mints.fetch_add(1, Ordering::SeqCst);
        Ok(MockRegistry::sample_record())
    }

    async fn mint_capacity_allowance(
        &self,
        _requests_per_kilosecond: u32,
        _days_until_expiration: u32,
    ) -> keyclaim::Result<String> {
        Ok("cap-1".into())
    }

    async fn finalize_claim(
        &self,
        claim: &ClaimResult,
        record: &ManagedKeyRecord,
        auth_method: &AuthMethod,
        scopes: &[AuthMethodScope],
    ) -> keyclaim::Result<TransactionHandle> {
        self.finalizes.fetch_add(1, Ordering::SeqCst);
        if self.reject_finalize {
            return Err(Error::ClaimRejected("signatures below on-chain quorum".into()));
        }
        *self.bound.lock().unwrap() = Some((
            record.token_id.clone(),
            auth_method.clone(),
            scopes.to_vec(),
        ));
        let _ = claim;
        Ok(TransactionHandle("0xtx1".into()))
    }
}

fn config(quorum: usize) -> NetworkConfig {
    let mut config = NetworkConfig::localhost();
    config.quorum = quorum;
    config.connect_timeout = Duration::from_millis(80);
    config.execute_deadline = Duration::from_millis(80);
    config
}

fn claim_config() -> ClaimConfig {
    ClaimConfig {
        claim_deadline: Duration::from_secs(5),
        max_attempts: 2,
        ..ClaimConfig::default()
    }
}

fn flow(
    quorum: usize,
    net: Arc<MockNet>,
    registry: Arc<MockRegistry>,
) -> ClaimFlow<Arc<MockRegistry>> {
    let network = NetworkClient::with_transport(config(quorum), net).unwrap();
    let identity = Identity::from_secret(&SECRET).unwrap();
    ClaimFlow::new(network, registry, identity, claim_config())
}

#[tokio::test]
async fn full_agreement_reaches_done() {
    let net = MockNet::default().arc();
    let registry = Arc::new(MockRegistry::new());
    let mut flow = flow(2, net.clone(), registry.clone());

    let receipt = flow.run("foo").await.unwrap();

    assert_eq!(flow.state(), ClaimState::Done);
    assert_eq!(receipt.derived_key_id, "abc123");
    assert_eq!(receipt.key_record.token_id, "9001");
    assert_eq!(receipt.tx, TransactionHandle("0xtx1".into()));

    // a key record was minted because none was supplied
    assert_eq!(registry.mints.load(Ordering::SeqCst), 1);
    assert_eq!(registry.finalizes.load(Ordering::SeqCst), 1);

    // permitted method list: exactly this identity's auth method
    let identity = Identity::from_secret(&SECRET).unwrap();
    let (token, method, scopes) = registry.bound.lock().unwrap().clone().unwrap();
    assert_eq!(token, "9001");
    assert_eq!(method, identity.auth_method());
    assert_eq!(scopes, vec![AuthMethodScope::PersonalSign]);

    // connection released exactly once
    assert_eq!(net.byes.load(Ordering::SeqCst), 3);
    assert_eq!(flow.network().state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn quorum_tolerates_one_silent_node() {
    let net = MockNet {
        silent_execute: vec!["node-3".into()],
        ..MockNet::default()
    }
    .arc();
    let registry = Arc::new(MockRegistry::new());
    let mut flow = flow(2, net.clone(), registry.clone());

    let receipt = flow.run("foo").await.unwrap();

    assert_eq!(flow.state(), ClaimState::Done);
    assert_eq!(receipt.derived_key_id, "abc123");
    assert_eq!(registry.finalizes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn strict_quorum_fails_on_one_silent_node() {
    let net = MockNet {
        silent_execute: vec!["node-3".into()],
        ..MockNet::default()
    }
    .arc();
    let registry = Arc::new(MockRegistry::new());
    let mut flow = flow(3, net.clone(), registry.clone());

    let err = flow.run("foo").await.unwrap_err();

    assert!(matches!(err, Error::QuorumNotReached { agreeing: 2, required: 3 }));
    assert_eq!(flow.state(), ClaimState::Failed);
    assert_eq!(registry.finalizes.load(Ordering::SeqCst), 0);

    // disconnect still ran, once per connected node
    assert_eq!(net.byes.load(Ordering::SeqCst), 3);
    assert_eq!(flow.network().state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn derived_id_disagreement_is_fatal() {
    let net = MockNet {
        derived: [("node-2".to_string(), "fff999".to_string())].into(),
        ..MockNet::default()
    }
    .arc();
    let registry = Arc::new(MockRegistry::new());
    let mut flow = flow(2, net.clone(), registry.clone());

    let err = flow.run("foo").await.unwrap_err();

    assert!(matches!(err, Error::InconsistentResult(_)));
    assert_eq!(err.kind(), keyclaim::ErrorKind::Consistency);
    assert_eq!(flow.state(), ClaimState::Failed);
    assert_eq!(registry.finalizes.load(Ordering::SeqCst), 0);

    // a consistency split is never retried: one execute round only
    assert_eq!(net.executes.load(Ordering::SeqCst), 3);
    assert_eq!(net.byes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn connect_failure_still_releases() {
    let net = MockNet {
        silent_handshake: vec!["node-1".into(), "node-2".into(), "node-3".into()],
        ..MockNet::default()
    }
    .arc();
    let registry = Arc::new(MockRegistry::new());
    let mut flow = flow(2, net.clone(), registry.clone());

    let err = flow.run("foo").await.unwrap_err();

    assert!(matches!(err, Error::NetworkUnreachable { .. }));
    assert_eq!(flow.state(), ClaimState::Failed);
    // nothing connected, so there were no sessions to tear down
    assert_eq!(net.byes.load(Ordering::SeqCst), 0);
    assert_eq!(flow.network().state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn session_refusal_below_quorum_fails_and_releases() {
    let net = MockNet {
        refuse_session: vec!["node-1".into(), "node-2".into()],
        ..MockNet::default()
    }
    .arc();
    let registry = Arc::new(MockRegistry::new());
    let mut flow = flow(2, net.clone(), registry.clone());

    let err = flow.run("foo").await.unwrap_err();

    assert!(matches!(err, Error::SessionIssuanceFailed { accepted: 1, required: 2 }));
    assert_eq!(flow.state(), ClaimState::Failed);
    assert_eq!(net.byes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn registry_rejection_fails_after_claim() {
    let net = MockNet::default().arc();
    let registry = Arc::new(MockRegistry::rejecting());
    let mut flow = flow(2, net.clone(), registry.clone());

    let err = flow.run("foo").await.unwrap_err();

    assert!(matches!(err, Error::ClaimRejected(_)));
    assert_eq!(flow.state(), ClaimState::Failed);
    // finalize is called at most once per claim, rejection or not
    assert_eq!(registry.finalizes.load(Ordering::SeqCst), 1);
    assert_eq!(net.byes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_reissues_fresh_credentials() {
    // every node fails the first execute round, then answers
    let net = MockNet {
        execute_failures: AtomicUsize::new(3),
        ..MockNet::default()
    }
    .arc();
    let registry = Arc::new(MockRegistry::new());
    let mut flow = flow(2, net.clone(), registry.clone());

    let receipt = flow.run("foo").await.unwrap();

    assert_eq!(flow.state(), ClaimState::Done);
    assert_eq!(receipt.derived_key_id, "abc123");

    // two issuance rounds: the retry signed in again instead of reusing
    // the first round's credentials
    assert_eq!(net.challenges.load(Ordering::SeqCst), 6);
    assert_eq!(net.executes.load(Ordering::SeqCst), 6);
    assert_eq!(net.byes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn claim_deadline_cancels_outstanding_calls() {
    let net = MockNet {
        silent_execute: vec!["node-1".into(), "node-2".into(), "node-3".into()],
        ..MockNet::default()
    }
    .arc();
    let registry = Arc::new(MockRegistry::new());

    let network = NetworkClient::with_transport(
        {
            let mut c = config(2);
            // per-call deadline longer than the claim deadline, so the
            // overall deadline is what cancels the fan-out
            c.execute_deadline = Duration::from_secs(30);
            c
        },
        net.clone(),
    )
    .unwrap();
    let identity = Identity::from_secret(&SECRET).unwrap();
    let mut flow = ClaimFlow::new(
        network,
        registry,
        identity,
        ClaimConfig {
            claim_deadline: Duration::from_millis(200),
            max_attempts: 2,
            ..ClaimConfig::default()
        },
    );

    let err = flow.run("foo").await.unwrap_err();

    assert!(matches!(err, Error::ClaimDeadlineElapsed(_)));
    assert_eq!(flow.state(), ClaimState::Failed);
    assert_eq!(net.byes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn supplied_key_record_skips_mint() {
    let net = MockNet::default().arc();
    let registry = Arc::new(MockRegistry::new());

    let network = NetworkClient::with_transport(config(2), net).unwrap();
    let identity = Identity::from_secret(&SECRET).unwrap();
    let mut flow = ClaimFlow::new(network, registry.clone(), identity, claim_config())
        .with_key_record(MockRegistry::sample_record());

    let receipt = flow.run("foo").await.unwrap();

    assert_eq!(receipt.key_record.token_id, "9001");
    assert_eq!(registry.mints.load(Ordering::SeqCst), 0);
    assert_eq!(registry.finalizes.load(Ordering::SeqCst), 1);
}
