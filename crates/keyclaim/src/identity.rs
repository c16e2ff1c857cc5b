//! wallet identity and message signing
//!
//! holds the secp256k1 signing key, produces recoverable personal-sign
//! signatures and derives the wallet address from the public key.
//!
//! the secret is always injected by the caller. ambient fallbacks (env vars)
//! belong to the outermost composition point, never here.

use crate::{Error, Result};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};
use zeroize::Zeroize;

/// 20-byte wallet address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| Error::InvalidSecret(e.to_string()))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::InvalidSecret("address must be 20 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// recoverable signature over a personal-sign message: r || s || v
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletSignature(pub [u8; 65]);

impl WalletSignature {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| Error::SigningFailed(e.to_string()))?;
        let arr: [u8; 65] = bytes
            .try_into()
            .map_err(|_| Error::SigningFailed("signature must be 65 bytes".into()))?;
        Ok(Self(arr))
    }

    /// recover the signer address for `message`
    pub fn recover(&self, message: &[u8]) -> Result<Address> {
        let sig = Signature::from_slice(&self.0[..64])
            .map_err(|e| Error::SigningFailed(e.to_string()))?;
        let v = self.0[64].wrapping_sub(27);
        let recid = RecoveryId::from_byte(v)
            .ok_or_else(|| Error::SigningFailed(format!("bad recovery byte {}", self.0[64])))?;

        let digest = personal_digest(message);
        let verifying = VerifyingKey::recover_from_prehash(&digest, &sig, recid)
            .map_err(|e| Error::SigningFailed(e.to_string()))?;
        Ok(address_of(&verifying))
    }

    /// check the signature was produced by `expected` over `message`
    pub fn verify(&self, message: &[u8], expected: &Address) -> Result<()> {
        let recovered = self.recover(message)?;
        if recovered == *expected {
            Ok(())
        } else {
            Err(Error::BadSignature { address: expected.to_hex() })
        }
    }
}

/// authentication method types recognized by the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AuthMethodKind {
    Wallet,
}

impl AuthMethodKind {
    /// numeric tag used in registry calls
    pub fn type_id(&self) -> u32 {
        match self {
            AuthMethodKind::Wallet => 1,
        }
    }
}

/// an identity's authentication method, as the registry sees it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthMethod {
    pub kind: AuthMethodKind,
    /// deterministic method id: keccak256(address || ":wallet")
    pub id: [u8; 32],
}

impl AuthMethod {
    pub fn id_hex(&self) -> String {
        format!("0x{}", hex::encode(self.id))
    }
}

/// wallet identity: exclusive owner of its signing key
pub struct Identity {
    signing_key: SigningKey,
    address: Address,
}

impl Identity {
    /// construct from a 32-byte secret
    pub fn from_secret(secret: &[u8; 32]) -> Result<Self> {
        let signing_key = SigningKey::from_slice(secret)
            .map_err(|e| Error::InvalidSecret(e.to_string()))?;
        let address = address_of(signing_key.verifying_key());
        Ok(Self { signing_key, address })
    }

    /// construct from a hex-encoded secret, `0x` prefix optional
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let raw = secret_hex.strip_prefix("0x").unwrap_or(secret_hex);
        let mut bytes = hex::decode(raw).map_err(|e| Error::InvalidSecret(e.to_string()))?;
        let result = match <[u8; 32]>::try_from(bytes.as_slice()) {
            Ok(arr) => Self::from_secret(&arr),
            Err(_) => Err(Error::InvalidSecret("secret must be 32 bytes".into())),
        };
        bytes.zeroize();
        result
    }

    /// construct from an optional secret, rejecting absence
    ///
    /// callers with an ambient fallback resolve it before this point.
    pub fn from_optional_hex(secret_hex: Option<&str>) -> Result<Self> {
        match secret_hex {
            Some(s) => Self::from_hex(s),
            None => Err(Error::IdentityUnavailable),
        }
    }

    /// wallet address, a pure function of the secret
    pub fn address(&self) -> Address {
        self.address
    }

    /// sign arbitrary bytes, personal-sign style
    pub fn sign(&self, message: &[u8]) -> Result<WalletSignature> {
        let digest = personal_digest(message);
        let (sig, recid) = self
            .signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| Error::SigningFailed(e.to_string()))?;

        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte() + 27;
        Ok(WalletSignature(out))
    }

    /// this identity's authentication method for registry permission lists
    pub fn auth_method(&self) -> AuthMethod {
        let mut hasher = Keccak256::new();
        hasher.update(self.address.as_bytes());
        hasher.update(b":wallet");
        AuthMethod {
            kind: AuthMethodKind::Wallet,
            id: hasher.finalize().into(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address.to_hex())
            .finish_non_exhaustive()
    }
}

/// keccak digest of the personal-sign envelope
fn personal_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n");
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// address = last 20 bytes of keccak256(uncompressed pubkey)
pub(crate) fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let mut hasher = Keccak256::new();
    hasher.update(&point.as_bytes()[1..]);
    let hash: [u8; 32] = hasher.finalize().into();
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    Address(addr)
}

/// address for a hex-encoded uncompressed public key
pub fn address_for_public_key(public_key_hex: &str) -> Result<Address> {
    let raw = public_key_hex.strip_prefix("0x").unwrap_or(public_key_hex);
    let bytes = hex::decode(raw).map_err(|e| Error::BadKeyRecord(e.to_string()))?;
    if bytes.len() != 65 || bytes[0] != 0x04 {
        return Err(Error::BadKeyRecord("expected 65-byte uncompressed public key".into()));
    }
    let mut hasher = Keccak256::new();
    hasher.update(&bytes[1..]);
    let hash: [u8; 32] = hasher.finalize().into();
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    Ok(Address(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = [7u8; 32];

    #[test]
    fn test_address_derivation() {
        let id = Identity::from_secret(&SECRET).unwrap();
        let id2 = Identity::from_secret(&SECRET).unwrap();
        assert_eq!(id.address(), id2.address());

        let other = Identity::from_secret(&[8u8; 32]).unwrap();
        assert_ne!(id.address(), other.address());
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let id = Identity::from_secret(&SECRET).unwrap();
        let msg = b"session request";

        let sig = id.sign(msg).unwrap();
        sig.verify(msg, &id.address()).unwrap();

        // tampered message recovers a different address
        assert!(sig.verify(b"session request!", &id.address()).is_err());
    }

    #[test]
    fn test_signature_hex_roundtrip() {
        let id = Identity::from_secret(&SECRET).unwrap();
        let sig = id.sign(b"abc").unwrap();
        let parsed = WalletSignature::from_hex(&sig.to_hex()).unwrap();
        assert_eq!(sig, parsed);
    }

    #[test]
    fn test_missing_secret_rejected() {
        let err = Identity::from_optional_hex(None).unwrap_err();
        assert!(matches!(err, Error::IdentityUnavailable));

        let err = Identity::from_hex("0xdeadbeef").unwrap_err();
        assert!(matches!(err, Error::InvalidSecret(_)));
    }

    #[test]
    fn test_auth_method_deterministic() {
        let id = Identity::from_secret(&SECRET).unwrap();
        let m1 = id.auth_method();
        let m2 = id.auth_method();
        assert_eq!(m1, m2);
        assert_eq!(m1.kind.type_id(), 1);
    }

    #[test]
    fn test_public_key_address_consistency() {
        let id = Identity::from_secret(&SECRET).unwrap();
        let point = id.signing_key.verifying_key().to_encoded_point(false);
        let pubkey_hex = format!("0x{}", hex::encode(point.as_bytes()));
        let derived = address_for_public_key(&pubkey_hex).unwrap();
        assert_eq!(derived, id.address());
    }
}
