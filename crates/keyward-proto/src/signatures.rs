//! Signature sets attached to key objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{KeyId, UserId};

/// Signatures over a key object: signer user → signer key id → signature.
///
/// Signatures are unpadded base64 strings. The set only ever grows through
/// [`SignatureSet::insert_if_absent`]; an entry for a `(signer, key id)` pair
/// is never overwritten once present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureSet(BTreeMap<UserId, BTreeMap<KeyId, String>>);

impl SignatureSet {
    /// Empty signature set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signature by `signer` with `key_id`, if present.
    pub fn get(&self, signer: &UserId, key_id: &KeyId) -> Option<&str> {
        self.0.get(signer).and_then(|sigs| sigs.get(key_id)).map(String::as_str)
    }

    /// Whether a signature by `signer` with `key_id` is present.
    pub fn contains(&self, signer: &UserId, key_id: &KeyId) -> bool {
        self.get(signer, key_id).is_some()
    }

    /// Insert a signature unless one already exists for the pair.
    ///
    /// Returns `true` if the signature was inserted.
    pub fn insert_if_absent(&mut self, signer: UserId, key_id: KeyId, signature: String) -> bool {
        let sigs = self.0.entry(signer).or_default();
        if sigs.contains_key(&key_id) {
            return false;
        }
        sigs.insert(key_id, signature);
        true
    }

    /// Add every entry of `other` that is not already present.
    ///
    /// Returns the number of entries added.
    pub fn extend_absent(&mut self, other: &SignatureSet) -> usize {
        other
            .iter()
            .filter(|(signer, key_id, sig)| {
                self.insert_if_absent((*signer).clone(), (*key_id).clone(), (*sig).to_string())
            })
            .count()
    }

    /// Entries for which `keep` returns `true`.
    pub fn filtered(&self, mut keep: impl FnMut(&UserId, &KeyId) -> bool) -> SignatureSet {
        let mut kept = SignatureSet::new();
        for (signer, key_id, sig) in self.iter() {
            if keep(signer, key_id) {
                kept.insert_if_absent(signer.clone(), key_id.clone(), sig.to_string());
            }
        }
        kept
    }

    /// Iterate over `(signer, key id, signature)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &KeyId, &str)> {
        self.0.iter().flat_map(|(signer, sigs)| {
            sigs.iter().map(move |(key_id, sig)| (signer, key_id, sig.as_str()))
        })
    }

    /// Total number of signatures.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    /// Whether no signatures are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
