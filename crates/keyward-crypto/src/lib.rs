//! Keyward cryptographic primitives.
//!
//! Signature handling for key objects. Every key object (device keys,
//! cross-signing keys) is signed over its canonical JSON form: the object
//! without its `signatures` and `unsigned` fields, keys sorted, no
//! insignificant whitespace, integers only. Signatures and public keys are
//! ed25519, transported as unpadded standard base64.
//!
//! # Trust
//!
//! Verification is pure: the caller decides which public key is allowed to
//! sign a given object and passes it in. [`SignatureEngine::merge_signatures`]
//! takes that decision as a lookup closure so a batch of incoming signatures
//! can be checked entry by entry without aborting on the first bad one.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod canonical;
pub mod encoding;
pub mod engine;
pub mod error;

pub use canonical::{canonical_json, signable_json};
pub use ed25519_dalek::{SigningKey, VerifyingKey};
pub use encoding::{decode_base64, decode_verifying_key, encode_base64, public_key_base64};
pub use engine::{MergeOutcome, RejectedSignature, SignatureEngine};
pub use error::SignatureError;
