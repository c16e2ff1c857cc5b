//! auth signatures over canonical sign-in messages
//!
//! a sign-in message binds: target uri, signer address, requested
//! capabilities, the network's freshness nonce and an expiration window.
//! rendering is deterministic: byte-identical inputs give byte-identical
//! text, which is what lets one signature be reused across nodes that
//! issue the same challenge.

use crate::identity::{Address, Identity};
use crate::resources::ResourceAbilityRequest;
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// how auth signatures produced here are derived
pub const DERIVED_VIA: &str = "wallet.personal-sign";

/// a signing challenge as presented to a [`ChallengeSigner`]
///
/// `network_nonce` is the network-wide freshness token fetched once per
/// issuance round; per-node nonces ride in the negotiation request, never
/// in the signed text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningChallenge {
    pub uri: String,
    pub chain: String,
    pub resources: Vec<ResourceAbilityRequest>,
    pub network_nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
}

/// canonical sign-in text for a challenge and signer address
pub fn sign_in_message(challenge: &SigningChallenge, address: &Address) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} wants you to sign in with your wallet:\n{}\n\n",
        challenge.uri,
        address.to_hex()
    ));
    out.push_str("Grant the listed capabilities over the listed resources.\n\n");
    out.push_str(&format!("URI: {}\n", challenge.uri));
    out.push_str("Version: 1\n");
    out.push_str(&format!("Chain: {}\n", challenge.chain));
    out.push_str(&format!("Nonce: {}\n", challenge.network_nonce));
    out.push_str(&format!(
        "Issued At: {}\n",
        challenge.issued_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    out.push_str(&format!(
        "Expiration Time: {}\n",
        challenge.expiration.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    out.push_str("Resources:\n");
    for req in &challenge.resources {
        out.push_str(&format!("- {}\n", req.recap_line()));
    }
    out
}

/// signed authorization artifact: message, signature, signer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSig {
    /// hex signature, r || s || v
    pub sig: String,
    pub derived_via: String,
    pub signed_message: String,
    /// hex signer address
    pub address: String,
}

impl AuthSig {
    /// check the signature verifies against the embedded address and message
    pub fn verify(&self) -> Result<()> {
        let address = Address::from_hex(&self.address)?;
        let sig = crate::identity::WalletSignature::from_hex(&self.sig)?;
        sig.verify(self.signed_message.as_bytes(), &address)
    }
}

/// produces an [`AuthSig`] for a signing challenge
///
/// one method so the production builder is substitutable with a
/// deterministic test double.
pub trait ChallengeSigner: Send + Sync {
    fn produce_auth_sig(&self, challenge: &SigningChallenge) -> Result<AuthSig>;
}

/// [`ChallengeSigner`] backed by a wallet identity
///
/// composes the canonical message and signs it fresh on every call; reuse
/// across byte-identical challenges is the issuer's concern, never cached
/// here.
pub struct AuthSigBuilder<'a> {
    identity: &'a Identity,
}

impl<'a> AuthSigBuilder<'a> {
    pub fn new(identity: &'a Identity) -> Self {
        Self { identity }
    }

    /// compose and sign outside a session round, e.g. for a standalone
    /// authorization check
    pub fn build(&self, challenge: &SigningChallenge) -> Result<AuthSig> {
        if challenge.expiration <= challenge.issued_at {
            return Err(Error::InvalidScopeRequest(
                "expiration not after issuance".into(),
            ));
        }

        let address = self.identity.address();
        let message = sign_in_message(challenge, &address);
        let sig = self.identity.sign(message.as_bytes())?;

        Ok(AuthSig {
            sig: sig.to_hex(),
            derived_via: DERIVED_VIA.into(),
            signed_message: message,
            address: address.to_hex(),
        })
    }
}

impl ChallengeSigner for AuthSigBuilder<'_> {
    fn produce_auth_sig(&self, challenge: &SigningChallenge) -> Result<AuthSig> {
        self.build(challenge)
    }
}
