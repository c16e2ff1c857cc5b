//! # keyclaim
//!
//! client for threshold key networks: obtain short-lived, scope-limited
//! session credentials from a quorum of independent nodes, then run a
//! distributed key-claim that derives and registers a keypair for a user
//! identifier.
//!
//! ## flow
//!
//! ```text
//! ┌──────────┐   personal-sign    ┌────────────────┐
//! │ Identity ├───────────────────▶│ AuthSigBuilder │
//! └──────────┘                    └───────┬────────┘
//!                                         │ auth sigs
//!                   ┌─────────────────────┼──────────────┐
//!                   ▼                     ▼              │
//!            ┌──────────────┐     ┌──────────────┐       │
//!            │ SessionIssuer│     │  capacity::  │       │
//!            │              │     │  delegate    │       │
//!            └──────┬───────┘     └──────┬───────┘       │
//!                   │ credentials        │ delegation    │
//!                   ▼                    ▼               │
//!            ┌─────────────────────────────────┐         │
//!            │  NetworkClient (quorum fan-out) │◀────────┘
//!            └──────────────┬──────────────────┘
//!                           │ claim result
//!                           ▼
//!            ┌──────────────────────┐     ┌──────────┐
//!            │  ClaimFlow           ├────▶│ Registry │
//!            │  (state machine)     │     │ (mint /  │
//!            └──────────────────────┘     │ finalize)│
//!                                         └──────────┘
//! ```
//!
//! ## guarantees
//!
//! - session credentials bind every node in a round to one network nonce
//!   fetched after connect and before any challenge is answered
//! - distributed results need a quorum of structurally consistent answers;
//!   derived-key-id disagreement is surfaced, never resolved silently
//! - disconnect runs exactly once per claim flow on every exit path
//!
//! ## usage
//!
//! ```rust,ignore
//! use keyclaim::{ClaimConfig, ClaimFlow, Identity, NetworkClient, NetworkConfig, RpcRegistry};
//!
//! let identity = Identity::from_hex(secret_hex)?;
//! let network = NetworkClient::new(NetworkConfig::rotko_testnet())?;
//! let registry = RpcRegistry::new("https://registry.rotko.net");
//!
//! let mut flow = ClaimFlow::new(network, registry, identity, ClaimConfig::default());
//! let receipt = flow.run("alice@example.com").await?;
//! println!("claimed {} in {}", receipt.derived_key_id, receipt.tx.0);
//! ```

pub mod authsig;
pub mod capacity;
pub mod claim;
pub mod config;
pub mod error;
pub mod identity;
pub mod network;
pub mod registry;
pub mod resources;
pub mod session;

pub use authsig::{AuthSig, AuthSigBuilder, ChallengeSigner, SigningChallenge};
pub use capacity::{delegate, CapacityDelegationAuthSig, DelegationParams};
pub use claim::{ClaimFlow, ClaimReceipt, ClaimState, CLAIM_KEY_PROCEDURE};
pub use config::{ClaimConfig, NetworkConfig, NodeEndpoint};
pub use error::{Error, ErrorKind, Result};
pub use identity::{Address, AuthMethod, AuthMethodKind, Identity, WalletSignature};
pub use network::{
    ClaimResult, ConnectionState, ExecuteParams, HttpTransport, NetworkClient, NodeTransport,
    SignatureShare,
};
pub use registry::{AuthMethodScope, ManagedKeyRecord, Registry, RpcRegistry, TransactionHandle};
pub use resources::{Ability, ResourceAbilityRequest};
pub use session::{SessionCredentialSet, SessionIssuer};
