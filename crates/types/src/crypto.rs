//! BLS12-381 keys and signatures.
//!
//! Built on `blst` (min_pk: 48-byte public keys in G1, 96-byte signatures
//! in G2). A [`Signature`] is either an individual share or an aggregate;
//! aggregates over one message are checked with fast-aggregate-verify.
//! Aggregation does not subgroup-check the shares, the check happens
//! implicitly when the aggregate is verified.

use crate::NodeId;
use blst::min_pk as bls;
use blst::BLST_ERROR;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Domain separation tag for BLS signatures (proof-of-possession scheme).
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Errors from signature aggregation and key material handling.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregateError {
    /// Aggregation over an empty set of shares.
    #[error("cannot aggregate an empty set of signatures")]
    Empty,
    /// The underlying curve library rejected the input.
    #[error("bls aggregation failed: {0:?}")]
    Bls(BLST_ERROR),
    /// Key or signature bytes failed to deserialize.
    #[error("invalid key material: {0:?}")]
    InvalidMaterial(BLST_ERROR),
}

/// A BLS signing keypair.
pub struct KeyPair {
    secret: bls::SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let ikm: [u8; 32] = rand::random();
        Self::from_seed(ikm)
    }

    /// Derive a keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = bls::SecretKey::key_gen(&seed, &[])
            .expect("32 bytes of ikm always yield a valid secret key");
        let public = PublicKey {
            pubkey: secret.sk_to_pk(),
        };
        KeyPair { secret, public }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            sig: self.secret.sign(message, DST, &[]),
        }
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> PublicKey {
        self.public.clone()
    }

    /// The node identity derived from the public key.
    pub fn node_id(&self) -> NodeId {
        NodeId(*blake3::hash(&self.public.to_bytes()).as_bytes())
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        let secret = bls::SecretKey::from_bytes(&self.secret.to_bytes())
            .expect("serialized secret key round-trips");
        KeyPair {
            secret,
            public: self.public.clone(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// A BLS public key (48 bytes, G1).
#[derive(Clone)]
pub struct PublicKey {
    pubkey: bls::PublicKey,
}

impl PublicKey {
    /// Serialized length in bytes.
    pub const LENGTH: usize = 48;

    /// The compressed key bytes.
    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.pubkey.to_bytes()
    }

    /// Deserialize from compressed bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AggregateError> {
        let pubkey = bls::PublicKey::from_bytes(bytes).map_err(AggregateError::InvalidMaterial)?;
        Ok(PublicKey { pubkey })
    }

    /// Verify an individual signature share over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        signature.sig.verify(true, message, DST, &[], &self.pubkey, true) == BLST_ERROR::BLST_SUCCESS
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(&self.to_bytes());
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// A BLS signature share or aggregate (96 bytes, G2).
#[derive(Clone)]
pub struct Signature {
    sig: bls::Signature,
}

impl Signature {
    /// Serialized length in bytes.
    pub const LENGTH: usize = 96;

    /// The compressed signature bytes.
    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.sig.to_bytes()
    }

    /// Deserialize from compressed bytes. Subgroup checking is deferred to
    /// verification.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AggregateError> {
        let sig = bls::Signature::from_bytes(bytes).map_err(AggregateError::InvalidMaterial)?;
        Ok(Signature { sig })
    }

    /// Aggregate signature shares into a single multisignature.
    pub fn aggregate(signatures: &[Signature]) -> Result<Signature, AggregateError> {
        if signatures.is_empty() {
            return Err(AggregateError::Empty);
        }
        let shares: Vec<&bls::Signature> = signatures.iter().map(|s| &s.sig).collect();
        let agg = bls::AggregateSignature::aggregate(&shares, false).map_err(AggregateError::Bls)?;
        Ok(Signature {
            sig: agg.to_signature(),
        })
    }

    /// Verify a multisignature over a single `message` against the public
    /// keys of all participating signers.
    pub fn verify_aggregate(&self, message: &[u8], public_keys: &[&PublicKey]) -> bool {
        let keys: Vec<&bls::PublicKey> = public_keys.iter().map(|pk| &pk.pubkey).collect();
        self.sig.fast_aggregate_verify(true, message, DST, &keys) == BLST_ERROR::BLST_SUCCESS
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes()[..] == other.to_bytes()[..]
    }
}

impl Eq for Signature {}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

// Crypto material crosses the wire as raw bytes, or hex in human-readable
// formats.

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.to_bytes()))
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = deserialize_material(deserializer)?;
        PublicKey::from_bytes(&bytes).map_err(D::Error::custom)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.to_bytes()))
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = deserialize_material(deserializer)?;
        Signature::from_bytes(&bytes).map_err(D::Error::custom)
    }
}

fn deserialize_material<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    if deserializer.is_human_readable() {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(D::Error::custom)
    } else {
        serde_bytes_visit(deserializer)
    }
}

fn serde_bytes_visit<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    struct BytesVisitor;

    impl<'de> serde::de::Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("raw key material bytes")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }
    }

    deserializer.deserialize_byte_buf(BytesVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keys = KeyPair::from_seed([7u8; 32]);
        let sig = keys.sign(b"message");
        assert!(keys.public_key().verify(b"message", &sig));
        assert!(!keys.public_key().verify(b"other", &sig));
    }

    #[test]
    fn wrong_key_rejects() {
        let a = KeyPair::from_seed([1u8; 32]);
        let b = KeyPair::from_seed([2u8; 32]);
        let sig = a.sign(b"message");
        assert!(!b.public_key().verify(b"message", &sig));
    }

    #[test]
    fn aggregate_verifies_against_all_signers() {
        let keys: Vec<KeyPair> = (0..3u8).map(|i| KeyPair::from_seed([i + 1; 32])).collect();
        let shares: Vec<Signature> = keys.iter().map(|k| k.sign(b"quorum")).collect();
        let agg = Signature::aggregate(&shares).unwrap();

        let pks: Vec<PublicKey> = keys.iter().map(|k| k.public_key()).collect();
        let refs: Vec<&PublicKey> = pks.iter().collect();
        assert!(agg.verify_aggregate(b"quorum", &refs));

        // Missing one signer's key must fail verification.
        assert!(!agg.verify_aggregate(b"quorum", &refs[..2]));
    }

    #[test]
    fn aggregate_of_nothing_is_an_error() {
        assert_eq!(Signature::aggregate(&[]), Err(AggregateError::Empty));
    }

    #[test]
    fn signature_bytes_round_trip() {
        let keys = KeyPair::from_seed([9u8; 32]);
        let sig = keys.sign(b"bytes");
        let back = Signature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(sig, back);
    }

    #[test]
    fn node_id_is_stable() {
        let a = KeyPair::from_seed([3u8; 32]);
        let b = a.clone();
        assert_eq!(a.node_id(), b.node_id());
    }
}
