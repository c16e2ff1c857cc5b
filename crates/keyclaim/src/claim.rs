//! distributed key claim orchestration
//!
//! drives one claim flow end to end: connect, issue session credentials,
//! execute the distributed claim, finalize against the registry. the
//! orchestrator is the only place that decides retry vs fatal, and the
//! only caller of disconnect.

use crate::authsig::AuthSigBuilder;
use crate::config::ClaimConfig;
use crate::identity::Identity;
use crate::network::{ClaimResult, ExecuteParams, NetworkClient};
use crate::registry::{AuthMethodScope, ManagedKeyRecord, Registry, TransactionHandle};
use crate::resources::{Ability, ResourceAbilityRequest};
use crate::session::SessionIssuer;
use crate::{Error, Result};
use chrono::Utc;
use tokio::time::timeout;

/// agreed-upon remote procedure that derives and claims a key
pub const CLAIM_KEY_PROCEDURE: &str = "keyclaim/claim-key@1";

/// claim flow states
///
/// `Failed` is terminal and reachable from any non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimState {
    Idle,
    Connected,
    Authorized,
    Claimed,
    Finalized,
    Done,
    Failed,
}

/// terminal success report
#[derive(Clone, Debug)]
pub struct ClaimReceipt {
    pub key_record: ManagedKeyRecord,
    pub derived_key_id: String,
    pub tx: TransactionHandle,
}

/// orchestrates one key claim for one user identifier
///
/// owns the network connection exclusively for the duration of the flow.
pub struct ClaimFlow<R: Registry> {
    network: NetworkClient,
    registry: R,
    identity: Identity,
    config: ClaimConfig,
    key_record: Option<ManagedKeyRecord>,
    state: ClaimState,
}

impl<R: Registry> ClaimFlow<R> {
    pub fn new(network: NetworkClient, registry: R, identity: Identity, config: ClaimConfig) -> Self {
        Self {
            network,
            registry,
            identity,
            config,
            key_record: None,
            state: ClaimState::Idle,
        }
    }

    /// bind the claim to an existing key record instead of minting one
    pub fn with_key_record(mut self, record: ManagedKeyRecord) -> Self {
        self.key_record = Some(record);
        self
    }

    pub fn state(&self) -> ClaimState {
        self.state
    }

    pub fn network(&self) -> &NetworkClient {
        &self.network
    }

    /// run the flow to completion
    ///
    /// disconnect runs exactly once on every exit path before the outcome
    /// is reported; a failed run leaves the user id unclaimed and safe to
    /// retry from scratch.
    pub async fn run(&mut self, user_id: &str) -> Result<ClaimReceipt> {
        let result = self.run_to_finalized(user_id).await;
        self.network.disconnect().await;

        match result {
            Ok(receipt) => {
                self.state = ClaimState::Done;
                tracing::info!(
                    "claim for {user_id} done: key {} bound to {}",
                    receipt.derived_key_id,
                    receipt.key_record.token_id
                );
                Ok(receipt)
            }
            Err(e) => {
                self.state = ClaimState::Failed;
                tracing::error!("claim for {user_id} failed ({:?}): {e}", e.kind());
                Err(e)
            }
        }
    }

    async fn run_to_finalized(&mut self, user_id: &str) -> Result<ClaimReceipt> {
        self.connect_with_retries().await?;
        self.state = ClaimState::Connected;

        let claim = self.claim_with_retries(user_id).await?;
        self.finalize(claim).await
    }

    async fn connect_with_retries(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.network.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.retryable() && attempt < self.config.max_attempts => {
                    let backoff = std::time::Duration::from_millis(200 * attempt as u64);
                    tracing::warn!("connect attempt {attempt} failed ({e}), retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// issue credentials and execute the claim, bounded by the overall
    /// claim deadline
    ///
    /// every retry starts from fresh session credentials; partial results
    /// of a failed round are never reused. an elapsed deadline cancels the
    /// outstanding per-node calls.
    async fn claim_with_retries(&mut self, user_id: &str) -> Result<ClaimResult> {
        let deadline = self.config.claim_deadline;
        let started = std::time::Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or(Error::ClaimDeadlineElapsed(deadline.as_secs()))?;

            match timeout(remaining, self.attempt_claim(user_id)).await {
                Ok(Ok(claim)) => return Ok(claim),
                Ok(Err(e)) if e.retryable() && attempt < self.config.max_attempts => {
                    tracing::warn!(
                        "claim attempt {attempt} failed ({e}), retrying with fresh credentials"
                    );
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Error::ClaimDeadlineElapsed(deadline.as_secs())),
            }
        }
    }

    async fn attempt_claim(&mut self, user_id: &str) -> Result<ClaimResult> {
        let requests = vec![
            ResourceAbilityRequest::any(Ability::PkpSigning),
            ResourceAbilityRequest::any(Ability::ActionExecution),
        ];
        let expiration = Utc::now() + self.config.session_lifetime;

        let signer = AuthSigBuilder::new(&self.identity);
        let issuer = SessionIssuer::new(
            &self.network,
            self.network.config().name.clone(),
            self.config.session_uri.clone(),
        );
        let credentials = issuer.issue(&signer, &requests, expiration).await?;
        self.state = ClaimState::Authorized;

        let params = ExecuteParams::ClaimKey { user_id: user_id.into() };
        let claim = self.network.execute(CLAIM_KEY_PROCEDURE, &params, &credentials).await?;
        self.state = ClaimState::Claimed;
        Ok(claim)
    }

    /// mint a key record if the caller supplied none, then bind the claim
    /// to it with a permitted-method list holding exactly this identity's
    /// auth method
    ///
    /// finalize is not idempotent at the registry, so it is called at most
    /// once per claim: no retry wraps this section.
    async fn finalize(&mut self, claim: ClaimResult) -> Result<ClaimReceipt> {
        let key_record = match self.key_record.clone() {
            Some(record) => record,
            None => self.registry.mint_managed_key().await?,
        };

        let auth_method = self.identity.auth_method();
        let tx = self
            .registry
            .finalize_claim(&claim, &key_record, &auth_method, &[AuthMethodScope::PersonalSign])
            .await?;
        self.state = ClaimState::Finalized;

        Ok(ClaimReceipt {
            key_record,
            derived_key_id: claim.derived_key_id,
            tx,
        })
    }
}
