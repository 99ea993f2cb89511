// Key Derivation and Address Management
//
// Addresses are Base58Check over a version byte plus RIPEMD160(SHA256(pubkey)).
// Version 0x00 renders the familiar "1..." form, 0x05 renders "3...".
// Signature checks must re-derive the address from the carried public key;
// syntactic validation alone says nothing about ownership.

use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::Digest;

use crate::crypto::hash::double_sha256;

/// Version byte for pay-to-pubkey-hash style addresses ("1...")
pub const ADDRESS_VERSION_P2PKH: u8 = 0x00;
/// Version byte for script-style addresses ("3...")
pub const ADDRESS_VERSION_SCRIPT: u8 = 0x05;

const CHECKSUM_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("invalid address length: must be 26-35 characters")]
    InvalidLength,
    #[error("invalid address prefix: must start with 1 or 3")]
    InvalidPrefix,
    #[error("invalid base58 encoding")]
    InvalidEncoding,
    #[error("invalid address checksum")]
    InvalidChecksum,
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid secret key material")]
    InvalidSecretKey,
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid DER signature encoding")]
    InvalidSignature,
}

/// A secp256k1 keypair. The public half is carried on the wire in
/// SEC1-compressed form.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut rand::thread_rng());
        let public = PublicKey::from_secret_key(secp256k1::SECP256K1, &secret);
        KeyPair { secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidSecretKey)?;
        let public = PublicKey::from_secret_key(secp256k1::SECP256K1, &secret);
        Ok(KeyPair { secret, public })
    }

    pub fn from_secret_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidSecretKey)?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    /// Standard P2PKH-style address for this keypair.
    pub fn address(&self) -> String {
        derive_address(&self.public.serialize(), ADDRESS_VERSION_P2PKH)
            .expect("serialized public key is always valid")
    }

    /// Sign a 32-byte digest, returning a DER-encoded ECDSA signature.
    pub fn sign(&self, digest: &[u8; 32]) -> Vec<u8> {
        let msg = Message::from_digest(*digest);
        secp256k1::SECP256K1
            .sign_ecdsa(&msg, &self.secret)
            .serialize_der()
            .to_vec()
    }
}

/// Derive a Pastella address from SEC1 public key bytes (compressed or
/// uncompressed, exactly as carried in a transaction input).
pub fn derive_address(pubkey_bytes: &[u8], version: u8) -> Result<String, KeyError> {
    // Reject garbage early so a malformed input cannot alias a real address.
    PublicKey::from_slice(pubkey_bytes).map_err(|_| KeyError::InvalidPublicKey)?;

    let sha = crate::crypto::hash::sha256(pubkey_bytes);
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha);
    let payload: [u8; 20] = ripemd.finalize().into();

    let mut versioned = Vec::with_capacity(1 + payload.len() + CHECKSUM_BYTES);
    versioned.push(version);
    versioned.extend_from_slice(&payload);

    let checksum = double_sha256(&versioned);
    versioned.extend_from_slice(&checksum[..CHECKSUM_BYTES]);

    Ok(bs58::encode(versioned).into_string())
}

/// Syntactic address validation: length, prefix and checksum.
pub fn validate_address(addr: &str) -> Result<(), AddressError> {
    if addr.len() < 26 || addr.len() > 35 {
        return Err(AddressError::InvalidLength);
    }
    if !(addr.starts_with('1') || addr.starts_with('3')) {
        return Err(AddressError::InvalidPrefix);
    }

    let decoded = bs58::decode(addr)
        .into_vec()
        .map_err(|_| AddressError::InvalidEncoding)?;
    if decoded.len() != 1 + 20 + CHECKSUM_BYTES {
        return Err(AddressError::InvalidEncoding);
    }

    let (body, checksum) = decoded.split_at(decoded.len() - CHECKSUM_BYTES);
    let expected = double_sha256(body);
    if checksum != &expected[..CHECKSUM_BYTES] {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(())
}

/// Verify a DER-encoded ECDSA signature over a 32-byte digest, given SEC1
/// public key bytes.
pub fn verify_signature(pubkey_bytes: &[u8], digest: &[u8; 32], der_sig: &[u8]) -> bool {
    let Ok(public) = PublicKey::from_slice(pubkey_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_der(der_sig) else {
        return false;
    };
    let msg = Message::from_digest(*digest);
    secp256k1::SECP256K1.verify_ecdsa(&msg, &sig, &public).is_ok()
}
