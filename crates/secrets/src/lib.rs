//! Encryption at rest for provider credentials.
//!
//! Secrets are sealed with AES-256-GCM under a 32-byte master key before
//! they reach storage. The wire format is versioned so the key schedule
//! can evolve without a flag day:
//!
//! ```text
//! version(1 byte) || nonce(12 bytes) || ciphertext+tag
//! ```
//!
//! Only version `0x01` exists today; any other version byte fails
//! decryption. Every encryption draws a fresh random nonce, so two
//! encryptions of the same plaintext produce distinct blobs.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Current blob format version.
const BLOB_VERSION: u8 = 0x01;
/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// Master key length in bytes.
pub const KEY_LEN: usize = 32;

/// Errors from sealing or opening secret blobs.
#[derive(Debug, Error)]
pub enum SecretError {
	/// The master key is not exactly 32 bytes.
	#[error("invalid key size: expected {KEY_LEN} bytes, got {0}")]
	InvalidKeySize(usize),

	/// The master key hex string could not be decoded.
	#[error("invalid key encoding: {0}")]
	InvalidKeyEncoding(String),

	/// The blob's version byte is unknown.
	#[error("unsupported secret blob version {0:#04x}")]
	UnsupportedVersion(u8),

	/// The blob is too short to contain a version, nonce, and tag.
	#[error("secret blob truncated ({0} bytes)")]
	Truncated(usize),

	/// Authentication failed: wrong key or corrupted blob.
	#[error("decryption failed")]
	Decryption,

	/// The cipher rejected the plaintext.
	#[error("encryption failed")]
	Encryption,

	/// The decrypted payload is not the expected JSON shape.
	#[error("secret payload decode: {0}")]
	Payload(#[from] serde_json::Error),
}

/// Seals and opens credential blobs under one master key.
#[derive(Clone)]
pub struct SecretBox {
	cipher: Aes256Gcm,
}

impl SecretBox {
	/// Build a secret box from a raw 32-byte key.
	pub fn new(key: &[u8]) -> Result<Self, SecretError> {
		if key.len() != KEY_LEN {
			return Err(SecretError::InvalidKeySize(key.len()));
		}
		Ok(Self {
			cipher: Aes256Gcm::new_from_slice(key).map_err(|_| SecretError::InvalidKeySize(key.len()))?,
		})
	}

	/// Build a secret box from a 64-character hex key.
	pub fn from_hex(key: &str) -> Result<Self, SecretError> {
		let bytes = hex::decode(key.trim()).map_err(|e| SecretError::InvalidKeyEncoding(e.to_string()))?;
		Self::new(&bytes)
	}

	/// Derive a key from an arbitrary secret string via SHA-256.
	///
	/// Intended for development setups without an externally supplied
	/// `MASTER_KEY`; production deployments must provide a real key.
	pub fn derive(secret: &str) -> Self {
		let digest = Sha256::digest(secret.as_bytes());
		Self {
			cipher: Aes256Gcm::new_from_slice(&digest).unwrap_or_else(|_| unreachable!("digest is 32 bytes")),
		}
	}

	/// Seal a plaintext into a versioned blob.
	pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecretError> {
		let mut nonce = [0u8; NONCE_LEN];
		rand::rng().fill_bytes(&mut nonce);

		let ciphertext = self
			.cipher
			.encrypt(Nonce::from_slice(&nonce), plaintext)
			.map_err(|_| SecretError::Encryption)?;

		let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
		blob.push(BLOB_VERSION);
		blob.extend_from_slice(&nonce);
		blob.extend_from_slice(&ciphertext);
		Ok(blob)
	}

	/// Open a versioned blob back into its plaintext.
	pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, SecretError> {
		// 16-byte GCM tag makes this the minimum well-formed blob.
		if blob.len() < 1 + NONCE_LEN + 16 {
			return Err(SecretError::Truncated(blob.len()));
		}
		if blob[0] != BLOB_VERSION {
			return Err(SecretError::UnsupportedVersion(blob[0]));
		}

		let nonce = &blob[1..1 + NONCE_LEN];
		let ciphertext = &blob[1 + NONCE_LEN..];

		self.cipher
			.decrypt(Nonce::from_slice(nonce), ciphertext)
			.map_err(|_| SecretError::Decryption)
	}

	/// Seal a JSON-serializable payload.
	pub fn encrypt_json<T: Serialize>(&self, payload: &T) -> Result<Vec<u8>, SecretError> {
		let plaintext = serde_json::to_vec(payload)?;
		self.encrypt(&plaintext)
	}

	/// Open a blob and decode its JSON payload.
	pub fn decrypt_json<T: DeserializeOwned>(&self, blob: &[u8]) -> Result<T, SecretError> {
		let plaintext = self.decrypt(blob)?;
		Ok(serde_json::from_slice(&plaintext)?)
	}
}

impl std::fmt::Debug for SecretBox {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SecretBox").finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use serde::{Deserialize, Serialize};

	use super::*;

	fn test_key(fill: u8) -> Vec<u8> {
		vec![fill; KEY_LEN]
	}

	#[test]
	fn round_trip() {
		let sb = SecretBox::new(&test_key(7)).unwrap();
		let blob = sb.encrypt(b"hunter2").unwrap();
		assert_eq!(sb.decrypt(&blob).unwrap(), b"hunter2");
	}

	#[test]
	fn wrong_key_fails() {
		let sealer = SecretBox::new(&test_key(7)).unwrap();
		let opener = SecretBox::new(&test_key(8)).unwrap();
		let blob = sealer.encrypt(b"hunter2").unwrap();
		assert!(matches!(opener.decrypt(&blob), Err(SecretError::Decryption)));
	}

	#[test]
	fn same_plaintext_yields_distinct_blobs() {
		let sb = SecretBox::new(&test_key(7)).unwrap();
		let a = sb.encrypt(b"hunter2").unwrap();
		let b = sb.encrypt(b"hunter2").unwrap();
		assert_ne!(a, b);
		// Nonces specifically must differ.
		assert_ne!(a[1..1 + 12], b[1..1 + 12]);
	}

	#[test]
	fn unknown_version_fails() {
		let sb = SecretBox::new(&test_key(7)).unwrap();
		let mut blob = sb.encrypt(b"hunter2").unwrap();
		blob[0] = 0x02;
		assert!(matches!(
			sb.decrypt(&blob),
			Err(SecretError::UnsupportedVersion(0x02))
		));
	}

	#[test]
	fn truncated_blob_fails() {
		let sb = SecretBox::new(&test_key(7)).unwrap();
		assert!(matches!(sb.decrypt(&[0x01, 0x02]), Err(SecretError::Truncated(2))));
	}

	#[test]
	fn invalid_key_size_rejected() {
		assert!(matches!(
			SecretBox::new(&[0u8; 16]),
			Err(SecretError::InvalidKeySize(16))
		));
	}

	#[test]
	fn hex_key_round_trip() {
		let key = "00".repeat(KEY_LEN);
		let sb = SecretBox::from_hex(&key).unwrap();
		let blob = sb.encrypt(b"x").unwrap();
		assert_eq!(sb.decrypt(&blob).unwrap(), b"x");
	}

	#[test]
	fn derived_key_is_deterministic() {
		let a = SecretBox::derive("dev-secret");
		let b = SecretBox::derive("dev-secret");
		let blob = a.encrypt(b"payload").unwrap();
		assert_eq!(b.decrypt(&blob).unwrap(), b"payload");
	}

	#[test]
	fn json_round_trip() {
		#[derive(Debug, PartialEq, Serialize, Deserialize)]
		struct Creds {
			token: String,
		}

		let sb = SecretBox::new(&test_key(1)).unwrap();
		let creds = Creds {
			token: "tok_123".into(),
		};
		let blob = sb.encrypt_json(&creds).unwrap();
		let back: Creds = sb.decrypt_json(&blob).unwrap();
		assert_eq!(back, creds);
	}
}
