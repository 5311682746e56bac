use std::convert::TryFrom;
use std::fs;
use std::path::Path;

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::errors::{ChainError, ChainResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha3_hex(data: &[u8]) -> String {
    hex::encode(sha3_256(data))
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.public.to_bytes()),
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = public_key_from_hex(&stored.public_key)?;
    if PublicKey::from(&secret) != public {
        return Err(ChainError::Config(
            "stored public key does not match secret key".into(),
        ));
    }
    Ok(Keypair { secret, public })
}

pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> ChainResult<()> {
    public_key
        .verify(message, signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

/// Account addresses are the sha3-256 digest of the ed25519 verifying key.
pub fn address_from_public_key(public_key: &PublicKey) -> String {
    sha3_hex(public_key.as_bytes())
}

/// Checks that `public_key_hex` belongs to `address` and that `signature_hex`
/// signs `message` under it.
pub fn verify_signer(
    address: &str,
    public_key_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> ChainResult<()> {
    let public_key = public_key_from_hex(public_key_hex)?;
    if address_from_public_key(&public_key) != address {
        return Err(ChainError::Crypto(format!(
            "public key does not belong to {address}"
        )));
    }
    let signature = signature_from_hex(signature_hex)?;
    verify_signature(&public_key, message, &signature)
}

pub fn public_key_from_hex(data: &str) -> ChainResult<PublicKey> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Crypto(format!("invalid public key encoding: {err}")))?;
    PublicKey::from_bytes(&bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
}

pub fn signature_from_hex(data: &str) -> ChainResult<Signature> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Crypto(format!("invalid signature encoding: {err}")))?;
    Signature::try_from(bytes.as_slice())
        .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))
}

pub fn signature_to_hex(signature: &Signature) -> String {
    hex::encode(signature.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_roundtrips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys/node.toml");
        let keypair = load_or_generate_keypair(&path).expect("generate");
        let loaded = load_keypair(&path).expect("load");
        assert_eq!(keypair.public, loaded.public);
    }

    #[test]
    fn signer_check_rejects_foreign_address() {
        let keypair = generate_keypair();
        let signature = signature_to_hex(&sign_message(&keypair, b"payload"));
        let public_key = hex::encode(keypair.public.to_bytes());
        let address = address_from_public_key(&keypair.public);

        verify_signer(&address, &public_key, b"payload", &signature).expect("valid signer");
        assert!(verify_signer(&sha3_hex(b"other"), &public_key, b"payload", &signature).is_err());
        assert!(verify_signer(&address, &public_key, b"tampered", &signature).is_err());
    }
}
