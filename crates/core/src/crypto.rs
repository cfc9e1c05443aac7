//! Hashing, secp256r1 key material, and script-hash derivation.

use crate::{CoreError, CoreResult, UInt160, UInt256};
use p256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a compressed SEC1 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Length of an ECDSA signature (r then s) in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Computes SHA-256 of the input.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Computes double SHA-256, the chain's identifier hash.
pub fn hash256(data: &[u8]) -> UInt256 {
    UInt256::from(sha256(&sha256(data)))
}

/// Computes RIPEMD-160 over SHA-256, the chain's script hash.
pub fn hash160(data: &[u8]) -> UInt160 {
    let digest: [u8; 20] = Ripemd160::digest(sha256(data)).into();
    UInt160::from(digest)
}

/// Computes the merkle root over an ordered list of hashes.
///
/// An empty list yields zero; odd levels duplicate their last element.
pub fn merkle_root(hashes: &[UInt256]) -> UInt256 {
    if hashes.is_empty() {
        return UInt256::zero();
    }
    let mut level: Vec<UInt256> = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("non-empty level"));
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut data = Vec::with_capacity(64);
                data.extend_from_slice(pair[0].as_bytes());
                data.extend_from_slice(pair[1].as_bytes());
                hash256(&data)
            })
            .collect();
    }
    level[0]
}

/// A compressed secp256r1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from compressed SEC1 bytes, validating that they
    /// name a point on the curve.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(CoreError::invalid_format(format!(
                "public key must be {PUBLIC_KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| CoreError::cryptography(format!("invalid public key: {e}")))?;
        Ok(Self(bytes.try_into().expect("length checked")))
    }

    /// Returns the compressed SEC1 encoding.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// The single-signature verification script for this key.
    pub fn verification_script(&self) -> Vec<u8> {
        single_sig_redeem_script(self)
    }

    /// The script hash of this key's single-signature verification script.
    pub fn script_hash(&self) -> UInt160 {
        hash160(&self.verification_script())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// A secp256r1 signing key with its public half.
pub struct KeyPair {
    secret: SigningKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a fresh random key pair.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Creates a key pair from a 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let secret = SigningKey::from_slice(bytes)
            .map_err(|e| CoreError::cryptography(format!("invalid secret key: {e}")))?;
        Ok(Self::from_signing_key(secret))
    }

    fn from_signing_key(secret: SigningKey) -> Self {
        let encoded = secret.verifying_key().to_encoded_point(true);
        let public = PublicKey(
            encoded
                .as_bytes()
                .try_into()
                .expect("compressed point is 33 bytes"),
        );
        Self { secret, public }
    }

    /// Returns the public key.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Signs the message with deterministic ECDSA, returning the raw r and s
    /// halves concatenated.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        let signature: Signature = self.secret.sign(message);
        let mut out = [0u8; SIGNATURE_SIZE];
        out.copy_from_slice(&signature.to_bytes());
        out
    }
}

/// Verifies an ECDSA signature against a compressed public key.
pub fn verify_signature(message: &[u8], signature: &[u8], public_key: &PublicKey) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(public_key.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

// Script opcodes used by the verification scripts below.
const OP_PUSHDATA1: u8 = 0x0c;
const OP_PUSHINT8: u8 = 0x00;
const OP_CHECKSIG: u8 = 0x41;
const OP_CHECKMULTISIG: u8 = 0x42;

/// Builds the single-signature verification (redeem) script for a key.
pub fn single_sig_redeem_script(public_key: &PublicKey) -> Vec<u8> {
    let mut script = Vec::with_capacity(PUBLIC_KEY_SIZE + 3);
    script.push(OP_PUSHDATA1);
    script.push(PUBLIC_KEY_SIZE as u8);
    script.extend_from_slice(public_key.as_bytes());
    script.push(OP_CHECKSIG);
    script
}

/// Builds the m-of-n multi-signature verification script over the given
/// keys, in the order supplied.
pub fn multi_sig_redeem_script(m: usize, public_keys: &[PublicKey]) -> CoreResult<Vec<u8>> {
    if m == 0 || m > public_keys.len() || public_keys.len() > u8::MAX as usize {
        return Err(CoreError::invalid_data(format!(
            "invalid multi-sig shape: {m} of {}",
            public_keys.len()
        )));
    }
    let mut script = Vec::with_capacity(2 + public_keys.len() * (PUBLIC_KEY_SIZE + 2) + 3);
    script.push(OP_PUSHINT8);
    script.push(m as u8);
    for key in public_keys {
        script.push(OP_PUSHDATA1);
        script.push(PUBLIC_KEY_SIZE as u8);
        script.extend_from_slice(key.as_bytes());
    }
    script.push(OP_PUSHINT8);
    script.push(public_keys.len() as u8);
    script.push(OP_CHECKMULTISIG);
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed: u8) -> KeyPair {
        let mut secret = [0u8; 32];
        secret[31] = seed;
        KeyPair::from_secret_bytes(&secret).unwrap()
    }

    #[test]
    fn test_sign_verify() {
        let pair = keypair(1);
        let message = b"basalt consensus";
        let signature = pair.sign(message);
        assert!(verify_signature(message, &signature, &pair.public_key()));
        assert!(!verify_signature(b"other message", &signature, &pair.public_key()));
    }

    #[test]
    fn test_sign_is_deterministic() {
        let pair = keypair(2);
        assert_eq!(pair.sign(b"msg"), pair.sign(b"msg"));
    }

    #[test]
    fn test_tampered_signature_fails() {
        let pair = keypair(3);
        let mut signature = pair.sign(b"msg");
        signature[0] ^= 0xff;
        assert!(!verify_signature(b"msg", &signature, &pair.public_key()));
    }

    #[test]
    fn test_public_key_validation() {
        assert!(PublicKey::from_bytes(&[0u8; 33]).is_err());
        assert!(PublicKey::from_bytes(&[2u8; 10]).is_err());
        let pair = keypair(4);
        let bytes = *pair.public_key().as_bytes();
        assert_eq!(PublicKey::from_bytes(&bytes).unwrap(), pair.public_key());
    }

    #[test]
    fn test_script_hash_is_stable() {
        let pair = keypair(5);
        let hash = pair.public_key().script_hash();
        assert_eq!(hash, pair.public_key().script_hash());
        assert!(!hash.is_zero());
    }

    #[test]
    fn test_merkle_root() {
        assert!(merkle_root(&[]).is_zero());

        let a = hash256(b"a");
        let b = hash256(b"b");
        let c = hash256(b"c");

        // A single leaf is its own root.
        assert_eq!(merkle_root(&[a]), a);

        // Odd levels duplicate the last leaf.
        let ab = {
            let mut data = Vec::new();
            data.extend_from_slice(a.as_bytes());
            data.extend_from_slice(b.as_bytes());
            hash256(&data)
        };
        let cc = {
            let mut data = Vec::new();
            data.extend_from_slice(c.as_bytes());
            data.extend_from_slice(c.as_bytes());
            hash256(&data)
        };
        let mut data = Vec::new();
        data.extend_from_slice(ab.as_bytes());
        data.extend_from_slice(cc.as_bytes());
        assert_eq!(merkle_root(&[a, b, c]), hash256(&data));
    }

    #[test]
    fn test_multi_sig_script_shape() {
        let keys: Vec<PublicKey> = (1..=4).map(|i| keypair(i).public_key()).collect();
        let script = multi_sig_redeem_script(3, &keys).unwrap();
        assert_eq!(script[1], 3);
        assert_eq!(*script.last().unwrap(), OP_CHECKMULTISIG);
        assert!(multi_sig_redeem_script(0, &keys).is_err());
        assert!(multi_sig_redeem_script(5, &keys).is_err());
    }
}
