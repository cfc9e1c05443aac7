//! The per-height validator registry and quorum arithmetic.

use crate::{Error, Result};
use basalt_config::ProtocolSettings;
use basalt_core::crypto::{multi_sig_redeem_script, PublicKey};
use basalt_core::{crypto, UInt160};

/// Byzantine fault tolerance for a validator count: `F = (N − 1) / 3`.
pub fn fault_tolerance(count: usize) -> usize {
    (count - 1) / 3
}

/// Safety quorum for a validator count: `M = N − F`.
pub fn safety_quorum(count: usize) -> usize {
    count - fault_tolerance(count)
}

/// The validator set for one block height.
///
/// Membership is immutable for the lifetime of the height. The local node
/// either occupies one index or observes watch-only.
#[derive(Debug, Clone)]
pub struct ValidatorRegistry {
    validators: Vec<PublicKey>,
    script_hashes: Vec<UInt160>,
    my_index: Option<u8>,
}

impl ValidatorRegistry {
    /// Creates a registry over an ordered validator list. `my_key` selects
    /// the local node's slot; a key outside the set means watch-only.
    pub fn new(validators: Vec<PublicKey>, my_key: Option<&PublicKey>) -> Result<Self> {
        if validators.len() < 4 {
            return Err(Error::InvalidValidator(format!(
                "validator set of {} is below the minimum of 4",
                validators.len()
            )));
        }
        if validators.len() > u8::MAX as usize {
            return Err(Error::InvalidValidator(
                "validator set exceeds 255 members".to_string(),
            ));
        }
        let script_hashes = validators.iter().map(PublicKey::script_hash).collect();
        let my_index =
            my_key.and_then(|key| validators.iter().position(|v| v == key).map(|i| i as u8));
        Ok(Self {
            validators,
            script_hashes,
            my_index,
        })
    }

    /// Builds a registry from protocol settings (hex-encoded keys).
    pub fn from_settings(settings: &ProtocolSettings, my_key: Option<&PublicKey>) -> Result<Self> {
        let validators = settings
            .validators
            .iter()
            .map(|text| {
                let bytes = hex::decode(text)
                    .map_err(|e| Error::InvalidValidator(format!("invalid hex key: {e}")))?;
                PublicKey::from_bytes(&bytes).map_err(Error::Core)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(validators, my_key)
    }

    /// The validator count `N`.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Always false; a registry holds at least four validators.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// The fault tolerance `F`.
    pub fn f(&self) -> usize {
        fault_tolerance(self.len())
    }

    /// The safety quorum `M`.
    pub fn m(&self) -> usize {
        safety_quorum(self.len())
    }

    /// The local node's validator index, or `None` when watch-only.
    pub fn my_index(&self) -> Option<u8> {
        self.my_index
    }

    /// Whether the local node observes without a validator slot.
    pub fn watch_only(&self) -> bool {
        self.my_index.is_none()
    }

    /// The public key at `index`.
    pub fn key(&self, index: u8) -> Option<&PublicKey> {
        self.validators.get(index as usize)
    }

    /// The single-signature script hash of the validator at `index`.
    pub fn script_hash(&self, index: u8) -> Option<UInt160> {
        self.script_hashes.get(index as usize).copied()
    }

    /// The index of the given key, if it is a member.
    pub fn index_of(&self, key: &PublicKey) -> Option<u8> {
        self.validators.iter().position(|v| v == key).map(|i| i as u8)
    }

    /// All member keys in registry order.
    pub fn keys(&self) -> &[PublicKey] {
        &self.validators
    }

    /// The priority primary for `(height, view)`: `(h − v) mod N`.
    pub fn priority_primary(&self, height: u32, view_number: u8) -> u8 {
        self.primary_at_offset(height, view_number, 0)
    }

    /// The fallback primary for `(height, view)`: `(h − v − 1) mod N`.
    ///
    /// May coincide with the priority primary, in which case the fallback
    /// slot is inert for the view.
    pub fn fallback_primary(&self, height: u32, view_number: u8) -> u8 {
        self.primary_at_offset(height, view_number, 1)
    }

    fn primary_at_offset(&self, height: u32, view_number: u8, offset: u64) -> u8 {
        let n = self.len() as u64;
        // Lift into u64 with an n·2⁹ bias so the subtraction cannot wrap.
        let biased = height as u64 + n * 512 - view_number as u64 - offset;
        (biased % n) as u8
    }

    /// The script hash authorized to sign the next block: the M-of-N
    /// multi-signature contract over the member keys.
    pub fn next_consensus(&self) -> UInt160 {
        let script = multi_sig_redeem_script(self.m(), &self.validators)
            .expect("registry shape validated at construction");
        crypto::hash160(&script)
    }
}
