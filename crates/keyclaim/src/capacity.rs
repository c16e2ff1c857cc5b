//! capacity delegation
//!
//! lets a third-party address consume a bounded quota of network requests
//! from a pre-purchased capacity allowance. params guaranteed to be
//! rejected remotely are rejected locally, before any round trip.

use crate::identity::{Address, Identity};
use crate::network::{NetworkClient, RecordDelegationRequest};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

/// parameters of one delegation
#[derive(Clone, Debug)]
pub struct DelegationParams {
    /// reference to the pre-purchased capacity allowance
    pub capacity_token_ref: String,
    pub delegatees: Vec<Address>,
    pub max_uses: u32,
    pub deadline: DateTime<Utc>,
}

impl DelegationParams {
    fn validate(&self) -> Result<()> {
        if self.max_uses < 1 {
            return Err(Error::InvalidDelegationParams("max_uses must be at least 1".into()));
        }
        if self.deadline <= Utc::now() {
            return Err(Error::InvalidDelegationParams("deadline in the past".into()));
        }
        if self.delegatees.is_empty() {
            return Err(Error::InvalidDelegationParams("empty delegatee set".into()));
        }
        if self.capacity_token_ref.is_empty() {
            return Err(Error::InvalidDelegationParams("empty capacity token ref".into()));
        }
        Ok(())
    }
}

/// signed delegation artifact, consumed by nodes at request time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityDelegationAuthSig {
    /// hex delegator address
    pub delegator: String,
    /// hex delegatee addresses
    pub delegatees: Vec<String>,
    pub capacity_token_ref: String,
    pub max_uses: u32,
    /// iso-8601 deadline
    pub deadline: String,
    /// hex signature over the statement
    pub sig: String,
    pub signed_statement: String,
}

/// canonical delegation statement
fn delegation_statement(
    delegator: &Address,
    params: &DelegationParams,
    network_nonce: &str,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("Delegate capacity from {}\n", delegator.to_hex()));
    out.push_str(&format!("Token: {}\n", params.capacity_token_ref));
    out.push_str("Delegatees:\n");
    for delegatee in &params.delegatees {
        out.push_str(&format!("- {}\n", delegatee.to_hex()));
    }
    out.push_str(&format!("Max Uses: {}\n", params.max_uses));
    out.push_str(&format!(
        "Deadline: {}\n",
        params.deadline.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    out.push_str(&format!("Nonce: {network_nonce}\n"));
    out
}

/// sign a delegation and have the network record it
///
/// single round trip: at least one node must accept the record; per-node
/// failures are logged at debug level.
pub async fn delegate(
    network: &NetworkClient,
    identity: &Identity,
    params: DelegationParams,
) -> Result<CapacityDelegationAuthSig> {
    params.validate()?;

    let network_nonce = network.latest_nonce().await?;
    let delegator = identity.address();
    let statement = delegation_statement(&delegator, &params, &network_nonce);
    let sig = identity.sign(statement.as_bytes())?;

    let delegation = CapacityDelegationAuthSig {
        delegator: delegator.to_hex(),
        delegatees: params.delegatees.iter().map(|d| d.to_hex()).collect(),
        capacity_token_ref: params.capacity_token_ref,
        max_uses: params.max_uses,
        deadline: params.deadline.to_rfc3339_opts(SecondsFormat::Secs, true),
        sig: sig.to_hex(),
        signed_statement: statement,
    };

    let nodes = network.connected_nodes().await?;
    let deadline = network.config().execute_deadline;
    let req = RecordDelegationRequest { delegation: delegation.clone() };

    let accepted = join_all(nodes.iter().map(|node| {
        let req = req.clone();
        let transport = network.transport();
        async move {
            match timeout(deadline, transport.record_delegation(node, &req)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::debug!("delegation record on {} failed: {}", node.id, e);
                    false
                }
                Err(_) => {
                    tracing::debug!("delegation record on {} timed out", node.id);
                    false
                }
            }
        }
    }))
    .await
    .into_iter()
    .filter(|ok| *ok)
    .count();

    if accepted == 0 {
        return Err(Error::DelegationRejected);
    }

    tracing::info!(
        "capacity delegation recorded on {} of {} nodes",
        accepted,
        nodes.len()
    );
    Ok(delegation)
}
