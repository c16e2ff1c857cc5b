//! session credential issuance
//!
//! negotiates a bounded-lifetime credential per node, scoped to an explicit
//! set of (resource, ability) pairs. the round binds every node to one
//! network nonce fetched after connect and before any challenge is
//! answered, so no node can bind to a staler point in time than another.

use crate::authsig::{ChallengeSigner, SigningChallenge};
use crate::capacity::CapacityDelegationAuthSig;
use crate::network::{
    NetworkClient, NodeChallenge, NodeSessionGrant, NodeSessionRequest, SessionChallengeRequest,
};
use crate::registry::ManagedKeyRecord;
use crate::resources::{self, ResourceAbilityRequest};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use tokio::time::timeout;

/// scope-limited, bounded-lifetime session credentials, one per node
///
/// read-only after creation; invalid once the expiration passes.
#[derive(Clone, Debug)]
pub struct SessionCredentialSet {
    credentials: HashMap<String, String>,
    expiration: DateTime<Utc>,
    issued_at: DateTime<Utc>,
    granted: Vec<ResourceAbilityRequest>,
}

impl SessionCredentialSet {
    fn new(
        credentials: HashMap<String, String>,
        expiration: DateTime<Utc>,
        granted: Vec<ResourceAbilityRequest>,
    ) -> Result<Self> {
        let issued_at = Utc::now();
        if expiration <= issued_at {
            return Err(Error::SessionExpired(
                expiration.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        Ok(Self { credentials, expiration, issued_at, granted })
    }

    /// construct without creation invariants, for tests and custom transports
    pub fn new_unchecked(
        credentials: HashMap<String, String>,
        expiration: DateTime<Utc>,
        granted: Vec<ResourceAbilityRequest>,
    ) -> Self {
        Self { credentials, expiration, issued_at: Utc::now(), granted }
    }

    /// session payload for one node, if it granted this round
    pub fn payload_for(&self, node_id: &str) -> Option<&str> {
        self.credentials.get(node_id).map(|s| s.as_str())
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.credentials.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// abilities the whole set actually grants
    pub fn granted(&self) -> &[ResourceAbilityRequest] {
        &self.granted
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// error if the set has expired
    pub fn check_fresh(&self) -> Result<()> {
        if Utc::now() < self.expiration {
            Ok(())
        } else {
            Err(Error::SessionExpired(
                self.expiration.to_rfc3339_opts(SecondsFormat::Secs, true),
            ))
        }
    }
}

/// negotiates session credentials against a connected network
pub struct SessionIssuer<'a> {
    network: &'a NetworkClient,
    /// chain hint embedded in signed messages
    chain: String,
    /// sign-in uri presented to nodes
    uri: String,
}

impl<'a> SessionIssuer<'a> {
    pub fn new(network: &'a NetworkClient, chain: impl Into<String>, uri: impl Into<String>) -> Self {
        Self { network, chain: chain.into(), uri: uri.into() }
    }

    /// issue wallet-scoped session credentials
    pub async fn issue(
        &self,
        signer: &dyn ChallengeSigner,
        requests: &[ResourceAbilityRequest],
        expiration: DateTime<Utc>,
    ) -> Result<SessionCredentialSet> {
        self.issue_with(signer, requests, expiration, Vec::new(), None).await
    }

    /// issue credentials scoped to a managed key, consuming capacity
    /// delegations
    ///
    /// the follow-on flow once a key record exists: short expirations
    /// (minutes, not hours) are the norm here.
    pub async fn issue_for_key(
        &self,
        signer: &dyn ChallengeSigner,
        key_record: &ManagedKeyRecord,
        delegations: Vec<CapacityDelegationAuthSig>,
        requests: &[ResourceAbilityRequest],
        expiration: DateTime<Utc>,
    ) -> Result<SessionCredentialSet> {
        self.issue_with(
            signer,
            requests,
            expiration,
            delegations,
            Some(key_record.public_key.clone()),
        )
        .await
    }

    async fn issue_with(
        &self,
        signer: &dyn ChallengeSigner,
        requests: &[ResourceAbilityRequest],
        expiration: DateTime<Utc>,
        delegations: Vec<CapacityDelegationAuthSig>,
        key_public_key: Option<String>,
    ) -> Result<SessionCredentialSet> {
        resources::validate_requests(requests)?;
        if expiration <= Utc::now() {
            return Err(Error::InvalidScopeRequest("expiration in the past".into()));
        }

        // nonce order matters: fetched after connect, before any challenge
        // is answered, and shared by every node in the round
        let network_nonce = self.network.latest_nonce().await?;
        let issued_at = Utc::now();
        let nodes = self.network.connected_nodes().await?;
        let quorum = self.network.config().quorum;
        let deadline = self.network.config().execute_deadline;
        let expiration_str = expiration.to_rfc3339_opts(SecondsFormat::Secs, true);

        // phase 1: collect per-node challenges concurrently
        let challenge_req = SessionChallengeRequest {
            uri: self.uri.clone(),
            resources: requests.to_vec(),
            expiration: expiration_str.clone(),
        };
        let challenges: Vec<(usize, NodeChallenge)> =
            join_all(nodes.iter().enumerate().map(|(i, node)| {
                let req = challenge_req.clone();
                let transport = self.network.transport();
                async move {
                    match timeout(deadline, transport.session_challenge(node, &req)).await {
                        Ok(Ok(challenge)) => Some((i, challenge)),
                        Ok(Err(e)) => {
                            tracing::warn!("challenge from {} failed: {}", node.id, e);
                            None
                        }
                        Err(_) => {
                            tracing::warn!("challenge from {} timed out", node.id);
                            None
                        }
                    }
                }
            }))
            .await
            .into_iter()
            .flatten()
            .collect();

        // phase 2: sign each distinct challenge once; a signature is shared
        // between nodes only when the composed message is byte-identical
        let mut signed: Vec<(SigningChallenge, crate::authsig::AuthSig)> = Vec::new();
        let mut negotiations = Vec::new();
        for (i, challenge) in challenges {
            let signing = SigningChallenge {
                uri: challenge.uri.clone(),
                chain: self.chain.clone(),
                resources: requests.to_vec(),
                network_nonce: network_nonce.clone(),
                issued_at,
                expiration,
            };
            let auth_sig = match signed.iter().find(|(c, _)| *c == signing) {
                Some((_, sig)) => sig.clone(),
                None => {
                    let sig = signer.produce_auth_sig(&signing)?;
                    signed.push((signing, sig.clone()));
                    sig
                }
            };
            let req = NodeSessionRequest {
                auth_sig,
                resources: requests.to_vec(),
                expiration: expiration_str.clone(),
                node_nonce: challenge.node_nonce,
                delegations: delegations.clone(),
                key_public_key: key_public_key.clone(),
            };
            negotiations.push((i, req));
        }

        // phase 3: negotiate concurrently, fan back in
        let grants: Vec<NodeSessionGrant> = join_all(negotiations.into_iter().map(|(i, req)| {
            let node = nodes[i].clone();
            let transport = self.network.transport();
            async move {
                match timeout(deadline, transport.negotiate_session(&node, &req)).await {
                    Ok(Ok(grant)) => Some(grant),
                    Ok(Err(e)) => {
                        tracing::warn!("session from {} refused: {}", node.id, e);
                        None
                    }
                    Err(_) => {
                        tracing::warn!("session from {} timed out", node.id);
                        None
                    }
                }
            }
        }))
        .await
        .into_iter()
        .flatten()
        .collect();

        // a node granting abilities that were never requested is a protocol
        // violation: its grant does not count toward quorum
        let mut accepted: Vec<NodeSessionGrant> = Vec::new();
        for grant in grants {
            if resources::is_subset(&grant.granted, requests) {
                accepted.push(grant);
            } else {
                tracing::warn!("{} granted abilities outside the request, ignoring", grant.node_id);
            }
        }

        if accepted.len() < quorum {
            return Err(Error::SessionIssuanceFailed {
                accepted: accepted.len(),
                required: quorum,
            });
        }

        // the set grants what every accepting node granted; narrowing by the
        // network is surfaced, never hidden
        let granted: Vec<ResourceAbilityRequest> = requests
            .iter()
            .filter(|req| accepted.iter().all(|grant| grant.granted.contains(req)))
            .cloned()
            .collect();
        if granted.len() < requests.len() {
            tracing::warn!(
                "network narrowed session scope to {} of {} requested abilities",
                granted.len(),
                requests.len()
            );
        }

        let credentials = accepted
            .into_iter()
            .map(|grant| (grant.node_id, grant.payload))
            .collect();
        SessionCredentialSet::new(credentials, expiration, granted)
    }
}
