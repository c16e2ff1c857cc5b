//! registry client for managed keys and capacity allowances
//!
//! the registry is an on-chain-style collaborator: mint a managed key
//! placeholder, mint a capacity allowance, finalize a claim by binding a
//! derived key and its authorized methods to a minted identity. call
//! encoding beyond this envelope belongs to the collaborator.

use crate::identity::{address_for_public_key, AuthMethod};
use crate::network::{ClaimResult, SignatureShare};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// registry-held managed key placeholder ("PKP")
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedKeyRecord {
    pub token_id: String,
    /// hex uncompressed public key
    pub public_key: String,
    /// hex address derived from the public key
    pub address: String,
}

impl ManagedKeyRecord {
    /// check the address is the hash of the public key
    pub fn check_consistent(&self) -> Result<()> {
        let derived = address_for_public_key(&self.public_key)?;
        if derived.to_hex() == self.address.to_lowercase() {
            Ok(())
        } else {
            Err(Error::BadKeyRecord(format!(
                "address {} does not match public key (expected {})",
                self.address,
                derived.to_hex()
            )))
        }
    }
}

/// what a permitted auth method may do with the key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethodScope {
    SignAnything,
    PersonalSign,
}

impl AuthMethodScope {
    pub fn scope_id(&self) -> u32 {
        match self {
            AuthMethodScope::SignAnything => 1,
            AuthMethodScope::PersonalSign => 2,
        }
    }
}

/// handle to a submitted registry transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHandle(pub String);

/// registry operations needed by the claim flow
///
/// `finalize_claim` is not idempotent: every call attempts a new
/// mint-and-bind, so the orchestrator calls it at most once per claim.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// mint a new managed key placeholder
    async fn mint_managed_key(&self) -> Result<ManagedKeyRecord>;

    /// mint a capacity allowance, returns its token reference
    async fn mint_capacity_allowance(
        &self,
        requests_per_kilosecond: u32,
        days_until_expiration: u32,
    ) -> Result<String>;

    /// register a derived key and its authorized methods against a minted
    /// key record
    async fn finalize_claim(
        &self,
        claim: &ClaimResult,
        record: &ManagedKeyRecord,
        auth_method: &AuthMethod,
        scopes: &[AuthMethodScope],
    ) -> Result<TransactionHandle>;
}

#[async_trait::async_trait]
impl<R: Registry + ?Sized> Registry for std::sync::Arc<R> {
    async fn mint_managed_key(&self) -> Result<ManagedKeyRecord> {
        (**self).mint_managed_key().await
    }

    async fn mint_capacity_allowance(
        &self,
        requests_per_kilosecond: u32,
        days_until_expiration: u32,
    ) -> Result<String> {
        (**self)
            .mint_capacity_allowance(requests_per_kilosecond, days_until_expiration)
            .await
    }

    async fn finalize_claim(
        &self,
        claim: &ClaimResult,
        record: &ManagedKeyRecord,
        auth_method: &AuthMethod,
        scopes: &[AuthMethodScope],
    ) -> Result<TransactionHandle> {
        (**self).finalize_claim(claim, record, auth_method, scopes).await
    }
}

// === wire records ===

#[derive(Debug, Serialize)]
struct MintKeyRequest {}

#[derive(Debug, Deserialize)]
struct MintKeyResponse {
    ok: bool,
    key: Option<ManagedKeyRecord>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct MintCapacityRequest {
    requests_per_kilosecond: u32,
    days_until_expiration: u32,
}

#[derive(Debug, Deserialize)]
struct MintCapacityResponse {
    ok: bool,
    token_ref: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct FinalizeRequest {
    user_id: String,
    derived_key_id: String,
    signatures: Vec<SignatureShare>,
    token_id: String,
    auth_method_type: u32,
    auth_method_id: String,
    scopes: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct FinalizeResponse {
    ok: bool,
    tx_hash: Option<String>,
    error: Option<String>,
}

/// json-over-http registry client
pub struct RpcRegistry {
    endpoint: String,
    http: reqwest::Client,
}

impl RpcRegistry {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), http: reqwest::Client::new() }
    }

    async fn post<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp> {
        let resp = self
            .http
            .post(format!("{}/{}", self.endpoint, path))
            .json(req)
            .send()
            .await
            .map_err(|e| Error::RegistryUnavailable(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| Error::RegistryUnavailable(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Registry for RpcRegistry {
    async fn mint_managed_key(&self) -> Result<ManagedKeyRecord> {
        let resp: MintKeyResponse = self.post("key/mint", &MintKeyRequest {}).await?;
        let key = match (resp.ok, resp.key) {
            (true, Some(key)) => key,
            _ => {
                return Err(Error::RegistryUnavailable(
                    resp.error.unwrap_or_else(|| "mint returned no key".into()),
                ))
            }
        };
        key.check_consistent()?;
        tracing::info!("minted managed key {} ({})", key.token_id, key.address);
        Ok(key)
    }

    async fn mint_capacity_allowance(
        &self,
        requests_per_kilosecond: u32,
        days_until_expiration: u32,
    ) -> Result<String> {
        let req = MintCapacityRequest { requests_per_kilosecond, days_until_expiration };
        let resp: MintCapacityResponse = self.post("capacity/mint", &req).await?;
        match (resp.ok, resp.token_ref) {
            (true, Some(token_ref)) => {
                tracing::info!("minted capacity allowance {token_ref}");
                Ok(token_ref)
            }
            _ => Err(Error::RegistryUnavailable(
                resp.error.unwrap_or_else(|| "mint returned no token".into()),
            )),
        }
    }

    async fn finalize_claim(
        &self,
        claim: &ClaimResult,
        record: &ManagedKeyRecord,
        auth_method: &AuthMethod,
        scopes: &[AuthMethodScope],
    ) -> Result<TransactionHandle> {
        let req = FinalizeRequest {
            user_id: claim.user_id.clone(),
            derived_key_id: claim.derived_key_id.clone(),
            signatures: claim.signatures.clone(),
            token_id: record.token_id.clone(),
            auth_method_type: auth_method.kind.type_id(),
            auth_method_id: auth_method.id_hex(),
            scopes: scopes.iter().map(|s| s.scope_id()).collect(),
        };
        let resp: FinalizeResponse = self.post("claim/finalize", &req).await?;
        match (resp.ok, resp.tx_hash) {
            (true, Some(tx_hash)) => {
                tracing::info!("claim finalized in {tx_hash}");
                Ok(TransactionHandle(tx_hash))
            }
            // the registry answered and said no: a validity rejection,
            // not a transport failure
            _ => Err(Error::ClaimRejected(
                resp.error.unwrap_or_else(|| "registry refused the claim".into()),
            )),
        }
    }
}
