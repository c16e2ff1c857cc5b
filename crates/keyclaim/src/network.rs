//! network client for the threshold node set
//!
//! fans requests out to every node concurrently and fans back in at a
//! quorum barrier. the wire transport is a collaborator behind
//! [`NodeTransport`]; the production implementation posts JSON over http.

use crate::authsig::AuthSig;
use crate::capacity::CapacityDelegationAuthSig;
use crate::config::{NetworkConfig, NodeEndpoint};
use crate::resources::ResourceAbilityRequest;
use crate::session::SessionCredentialSet;
use crate::{Error, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::timeout;

/// client version string sent in handshakes
pub const CLIENT_VERSION: &str = concat!("keyclaim/", env!("CARGO_PKG_VERSION"));

// === wire records ===
//
// closed field sets, one record per operation.

/// most recent block reference observed by a node, used as freshness nonce
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: u64,
    /// hex block hash
    pub hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub network: String,
    pub client_version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub node_id: String,
    pub latest_block: BlockRef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionChallengeRequest {
    pub uri: String,
    pub resources: Vec<ResourceAbilityRequest>,
    /// iso-8601 requested expiration
    pub expiration: String,
}

/// per-node challenge: the node's nonce must be echoed in the negotiation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeChallenge {
    pub node_id: String,
    pub node_nonce: String,
    /// uri the node expects in the signed message
    pub uri: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSessionRequest {
    pub auth_sig: AuthSig,
    pub resources: Vec<ResourceAbilityRequest>,
    pub expiration: String,
    pub node_nonce: String,
    /// capacity delegations consumed by this session, if any
    pub delegations: Vec<CapacityDelegationAuthSig>,
    /// managed key the session is scoped to, if any (hex public key)
    pub key_public_key: Option<String>,
}

/// signed session payload granted by one node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSessionGrant {
    pub node_id: String,
    pub granted: Vec<ResourceAbilityRequest>,
    /// opaque session payload, presented back to the node on execute
    pub payload: String,
    /// node signature over the payload, hex
    pub signature: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordDelegationRequest {
    pub delegation: CapacityDelegationAuthSig,
}

/// parameters of the remote procedure, one variant per operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ExecuteParams {
    ClaimKey { user_id: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// agreed-upon remote procedure identifier
    pub code: String,
    pub params: ExecuteParams,
    /// this node's session payload from the credential set
    pub session: String,
}

/// one node's partial result for a claim execution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePartial {
    pub node_id: String,
    /// hex derived key identifier, identical across honest nodes
    pub derived_key_id: String,
    /// this node's partial signature over the claim, hex
    pub signature: String,
}

/// partial signature share attributed to a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare {
    pub node_id: String,
    pub signature: String,
}

/// aggregated result of a distributed claim execution
///
/// consumed exactly once by registry finalization, then discarded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimResult {
    pub user_id: String,
    pub derived_key_id: String,
    pub signatures: Vec<SignatureShare>,
}

// === transport seam ===

/// wire collaborator for one node
///
/// implementations carry requests to a single node and surface transport
/// failures as [`Error::Transport`]. tests substitute deterministic doubles.
#[async_trait::async_trait]
pub trait NodeTransport: Send + Sync {
    async fn handshake(&self, node: &NodeEndpoint, req: &HandshakeRequest)
        -> Result<HandshakeResponse>;

    async fn session_challenge(&self, node: &NodeEndpoint, req: &SessionChallengeRequest)
        -> Result<NodeChallenge>;

    async fn negotiate_session(&self, node: &NodeEndpoint, req: &NodeSessionRequest)
        -> Result<NodeSessionGrant>;

    async fn record_delegation(&self, node: &NodeEndpoint, req: &RecordDelegationRequest)
        -> Result<()>;

    async fn execute(&self, node: &NodeEndpoint, req: &ExecuteRequest) -> Result<NodePartial>;

    /// best-effort session teardown for one node
    async fn bye(&self, node: &NodeEndpoint);
}

/// envelope for node responses that can fail application-side
#[derive(Clone, Debug, Serialize, Deserialize)]
struct NodeEnvelope<T> {
    ok: bool,
    body: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

impl<T> NodeEnvelope<T> {
    fn into_result(self) -> Result<T> {
        match (self.ok, self.body) {
            (true, Some(body)) => Ok(body),
            _ => Err(Error::Transport(
                self.error.unwrap_or_else(|| "node returned empty response".into()),
            )),
        }
    }
}

/// json-over-http transport
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    async fn post<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        node: &NodeEndpoint,
        path: &str,
        req: &Req,
    ) -> Result<Resp> {
        let resp = self
            .http
            .post(format!("{}/{}", node.url, path))
            .json(req)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let envelope: NodeEnvelope<Resp> = resp
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        envelope.into_result()
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NodeTransport for HttpTransport {
    async fn handshake(&self, node: &NodeEndpoint, req: &HandshakeRequest)
        -> Result<HandshakeResponse>
    {
        self.post(node, "handshake", req).await
    }

    async fn session_challenge(&self, node: &NodeEndpoint, req: &SessionChallengeRequest)
        -> Result<NodeChallenge>
    {
        self.post(node, "session/challenge", req).await
    }

    async fn negotiate_session(&self, node: &NodeEndpoint, req: &NodeSessionRequest)
        -> Result<NodeSessionGrant>
    {
        self.post(node, "session/negotiate", req).await
    }

    async fn record_delegation(&self, node: &NodeEndpoint, req: &RecordDelegationRequest)
        -> Result<()>
    {
        let _: serde_json::Value = self.post(node, "delegation/record", req).await?;
        Ok(())
    }

    async fn execute(&self, node: &NodeEndpoint, req: &ExecuteRequest) -> Result<NodePartial> {
        self.post(node, "execute", req).await
    }

    async fn bye(&self, node: &NodeEndpoint) {
        if let Err(e) = self.http.post(format!("{}/bye", node.url)).send().await {
            tracing::debug!("bye to {} failed: {}", node.id, e);
        }
    }
}

// === network client ===

/// connection state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { nodes: Vec<NodeEndpoint> },
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// client holding the live sessions with the node set
///
/// the connection is the one shared mutable resource of a claim flow and is
/// owned exclusively by one flow at a time.
pub struct NetworkClient {
    config: NetworkConfig,
    transport: Arc<dyn NodeTransport>,
    state: RwLock<ConnectionState>,
    latest_block: RwLock<Option<BlockRef>>,
}

impl NetworkClient {
    /// client over the production http transport
    pub fn new(config: NetworkConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(HttpTransport::new()))
    }

    /// client over a caller-supplied transport
    pub fn with_transport(config: NetworkConfig, transport: Arc<dyn NodeTransport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            state: RwLock::new(ConnectionState::Disconnected),
            latest_block: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> Arc<dyn NodeTransport> {
        self.transport.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.read().await, ConnectionState::Connected { .. })
    }

    /// nodes that answered the connect handshake
    pub async fn connected_nodes(&self) -> Result<Vec<NodeEndpoint>> {
        match &*self.state.read().await {
            ConnectionState::Connected { nodes } => Ok(nodes.clone()),
            _ => Err(Error::NotConnected),
        }
    }

    /// establish sessions with the node set
    ///
    /// blocks until a quorum of nodes answered the handshake or the connect
    /// timeout elapses per node. slow nodes count as unresponsive.
    pub async fn connect(&self) -> Result<()> {
        *self.state.write().await = ConnectionState::Connecting;
        tracing::info!(
            "connecting to {} ({} nodes, quorum {})",
            self.config.name,
            self.config.nodes.len(),
            self.config.quorum
        );

        let req = HandshakeRequest {
            network: self.config.name.clone(),
            client_version: CLIENT_VERSION.into(),
        };

        let calls = self.config.nodes.iter().map(|node| {
            let req = req.clone();
            let transport = self.transport.clone();
            async move {
                match timeout(self.config.connect_timeout, transport.handshake(node, &req)).await {
                    Ok(Ok(resp)) => Some((node.clone(), resp)),
                    Ok(Err(e)) => {
                        tracing::warn!("handshake with {} failed: {}", node.id, e);
                        None
                    }
                    Err(_) => {
                        tracing::warn!("handshake with {} timed out", node.id);
                        None
                    }
                }
            }
        });

        let responses: Vec<_> = join_all(calls).await.into_iter().flatten().collect();

        if responses.len() < self.config.quorum {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(Error::NetworkUnreachable {
                responsive: responses.len(),
                required: self.config.quorum,
            });
        }

        // highest observed block wins as the freshness reference
        let best = responses
            .iter()
            .map(|(_, resp)| resp.latest_block.clone())
            .max_by_key(|block| block.height);
        *self.latest_block.write().await = best;

        let nodes: Vec<NodeEndpoint> = responses.into_iter().map(|(node, _)| node).collect();
        tracing::info!("connected to {} of {} nodes", nodes.len(), self.config.nodes.len());
        *self.state.write().await = ConnectionState::Connected { nodes };
        Ok(())
    }

    /// most recent freshness token observed from the network
    pub async fn latest_nonce(&self) -> Result<String> {
        if !self.is_connected().await {
            return Err(Error::NotConnected);
        }
        self.latest_block
            .read()
            .await
            .as_ref()
            .map(|block| block.hash.clone())
            .ok_or(Error::NotConnected)
    }

    /// run the remote procedure across the quorum under session credentials
    ///
    /// returns an aggregated result only when at least quorum nodes answer
    /// within the deadline and every answer carries the same derived key id.
    pub async fn execute(
        &self,
        code: &str,
        params: &ExecuteParams,
        credentials: &SessionCredentialSet,
    ) -> Result<ClaimResult> {
        let nodes = self.connected_nodes().await?;
        credentials.check_fresh()?;

        let calls = nodes.iter().filter_map(|node| {
            let session = credentials.payload_for(&node.id)?.to_string();
            let req = ExecuteRequest {
                code: code.into(),
                params: params.clone(),
                session,
            };
            let transport = self.transport.clone();
            Some(async move {
                match timeout(self.config.execute_deadline, transport.execute(node, &req)).await {
                    Ok(Ok(partial)) => Some(partial),
                    Ok(Err(e)) => {
                        tracing::warn!("execute on {} failed: {}", node.id, e);
                        None
                    }
                    Err(_) => {
                        tracing::warn!("execute on {} timed out", node.id);
                        None
                    }
                }
            })
        });

        let partials: Vec<NodePartial> = join_all(calls).await.into_iter().flatten().collect();

        if partials.len() < self.config.quorum {
            return Err(Error::QuorumNotReached {
                agreeing: partials.len(),
                required: self.config.quorum,
            });
        }

        // every responding node must agree on the derived identifier;
        // a disagreement is surfaced, never resolved by picking one
        let derived_key_id = partials[0].derived_key_id.clone();
        if let Some(dissent) = partials.iter().find(|p| p.derived_key_id != derived_key_id) {
            return Err(Error::InconsistentResult(format!(
                "{} reported {}, {} reported {}",
                partials[0].node_id, derived_key_id, dissent.node_id, dissent.derived_key_id
            )));
        }

        let user_id = match params {
            ExecuteParams::ClaimKey { user_id } => user_id.clone(),
        };

        Ok(ClaimResult {
            user_id,
            derived_key_id,
            signatures: partials
                .into_iter()
                .map(|p| SignatureShare { node_id: p.node_id, signature: p.signature })
                .collect(),
        })
    }

    /// tear down all node sessions
    ///
    /// idempotent: repeated calls after the first are no-ops.
    pub async fn disconnect(&self) {
        let nodes = {
            let mut state = self.state.write().await;
            match std::mem::take(&mut *state) {
                ConnectionState::Connected { nodes } => nodes,
                _ => return,
            }
        };

        join_all(nodes.iter().map(|node| self.transport.bye(node))).await;
        *self.latest_block.write().await = None;
        tracing::info!("disconnected from {}", self.config.name);
    }
}
