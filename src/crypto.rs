//! Cryptographic primitives for encrypted sessions.
//!
//! Each endpoint owns an RSA [KeyPair]. During the handshake the server
//! draws a random session id, encrypts it with the client's public key
//! ([seal_secret]) and sends it back together with its own public key;
//! the client recovers it with [open_secret]. From then on the session id
//! bytes key an AES-128-GCM cipher with a fresh nonce per message.
//! Messages whose authenticity matters additionally carry an RSA
//! signature over the pre-encryption payload ([sign_data] /
//! [verify_data]).

use rand::RngCore as _;
use rsa::pkcs1::{DecodeRsaPublicKey as _, EncodeRsaPublicKey as _};
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest as _, Sha256};

use crate::guid::Guid;

/// Nonce length of the AES-GCM mode used for session encryption.
pub const AES_NONCE_SIZE: usize = 12;

/// Errors from RSA and AES operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("RSA operation failed")]
    Rsa(#[source] rsa::errors::Error),
    #[error("Invalid RSA public key blob")]
    PublicKeyBlob(#[source] rsa::pkcs1::Error),
    #[error("Failed to encrypt payload")]
    Encrypt,
    #[error("Failed to decrypt payload")]
    Decrypt,
    #[error("Signature did not verify")]
    SignatureMismatch,
    #[error("Decrypted shared secret has {len} bytes, expected {expected}")]
    SecretSize { len: usize, expected: usize },
}

/// Supported RSA key sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    Rsa2048,
    Rsa4096,
}

impl KeySize {
    pub fn bits(self) -> usize {
        match self {
            KeySize::Rsa2048 => 2048,
            KeySize::Rsa4096 => 4096,
        }
    }

    /// Length of signatures and of RSA-encrypted blobs produced with a
    /// key of this size.
    pub fn bytes(self) -> usize {
        self.bits() / 8
    }
}

impl Default for KeySize {
    fn default() -> Self {
        KeySize::Rsa2048
    }
}

/// An endpoint's RSA key pair, generated once at construction.
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    size: KeySize,
}

impl KeyPair {
    pub fn generate(size: KeySize) -> Result<Self, CryptoError> {
        let private =
            RsaPrivateKey::new(&mut rand::thread_rng(), size.bits()).map_err(CryptoError::Rsa)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self {
            private,
            public,
            size,
        })
    }

    pub fn key_size(&self) -> KeySize {
        self.size
    }

    /// The public half as a PKCS#1 DER blob, the form carried on the wire.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self
            .public
            .to_pkcs1_der()
            .map_err(CryptoError::PublicKeyBlob)?
            .as_bytes()
            .to_vec())
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(data);
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(CryptoError::Rsa)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(CryptoError::Rsa)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("size", &self.size).finish()
    }
}

/// The session secret RSA-encrypted to the receiver, together with the
/// sender's public key blob. Sent exactly once, inside the
/// `complete_handshake` payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedSecret {
    pub encrypted_secret: Vec<u8>,
    pub senders_public_key: Vec<u8>,
}

/// Encrypt `session_id` with the receiver's public key.
pub fn seal_secret(
    session_id: &Guid,
    receiver_public_key_der: &[u8],
    sender: &KeyPair,
) -> Result<EncryptedSecret, CryptoError> {
    let receiver =
        RsaPublicKey::from_pkcs1_der(receiver_public_key_der).map_err(CryptoError::PublicKeyBlob)?;
    let encrypted_secret = receiver
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, session_id.as_bytes())
        .map_err(CryptoError::Rsa)?;
    Ok(EncryptedSecret {
        encrypted_secret,
        senders_public_key: sender.public_key_der()?,
    })
}

/// Recover the session secret with the receiver's private key.
pub fn open_secret(secret: &EncryptedSecret, receiver: &KeyPair) -> Result<Guid, CryptoError> {
    let bytes = receiver.decrypt(&secret.encrypted_secret)?;
    Guid::from_slice(&bytes).ok_or(CryptoError::SecretSize {
        len: bytes.len(),
        expected: Guid::SIZE,
    })
}

/// A payload together with the sender's RSA signature over it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SignedMessageData {
    pub message_raw_data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Sign `data`, producing the wrapper carried inside authenticated
/// messages. The signature length equals the key size in bytes.
pub fn sign_data(data: Vec<u8>, signer: &KeyPair) -> Result<SignedMessageData, CryptoError> {
    let signature = signer.sign(&data)?;
    Ok(SignedMessageData {
        message_raw_data: data,
        signature,
    })
}

/// Verify a [SignedMessageData] against the sender's public key blob.
pub fn verify_data(
    signed: &SignedMessageData,
    senders_public_key_der: &[u8],
) -> Result<(), CryptoError> {
    let sender =
        RsaPublicKey::from_pkcs1_der(senders_public_key_der).map_err(CryptoError::PublicKeyBlob)?;
    let digest = Sha256::digest(&signed.message_raw_data);
    sender
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signed.signature)
        .map_err(|_| CryptoError::SignatureMismatch)
}

/// AES-128-GCM encrypt `plaintext` under the session secret with a fresh
/// random nonce. Returns `(nonce, ciphertext)`.
pub fn encrypt_payload(secret: &Guid, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    use aes_gcm::aead::Aead as _;
    use aes_gcm::KeyInit as _;

    let cipher = aes_gcm::Aes128Gcm::new(secret.as_bytes().into());
    let mut nonce = [0u8; AES_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt((&nonce).into(), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok((nonce.to_vec(), ciphertext))
}

/// AES-128-GCM decrypt `ciphertext` under the session secret. The caller
/// is responsible for validating the nonce length beforehand.
pub fn decrypt_payload(
    secret: &Guid,
    nonce: &[u8; AES_NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    use aes_gcm::aead::Aead as _;
    use aes_gcm::KeyInit as _;

    let cipher = aes_gcm::Aes128Gcm::new(secret.as_bytes().into());
    cipher
        .decrypt(nonce.into(), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryInto as _;

    fn test_key_pair() -> KeyPair {
        KeyPair::generate(KeySize::Rsa2048).unwrap()
    }

    #[test]
    fn seal_open_secret_roundtrip() {
        let server = test_key_pair();
        let client = test_key_pair();
        let session_id = Guid::random();

        let sealed = seal_secret(&session_id, &client.public_key_der().unwrap(), &server).unwrap();
        assert_eq!(sealed.senders_public_key, server.public_key_der().unwrap());

        let opened = open_secret(&sealed, &client).unwrap();
        assert_eq!(opened, session_id);
        assert!(!opened.is_nil());
    }

    #[test]
    fn open_secret_with_wrong_key_fails() {
        let server = test_key_pair();
        let client = test_key_pair();
        let other = test_key_pair();

        let sealed =
            seal_secret(&Guid::random(), &client.public_key_der().unwrap(), &server).unwrap();
        assert!(open_secret(&sealed, &other).is_err());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let pair = test_key_pair();
        let signed = sign_data(b"authenticated payload".to_vec(), &pair).unwrap();
        assert_eq!(signed.signature.len(), pair.key_size().bytes());
        verify_data(&signed, &pair.public_key_der().unwrap()).unwrap();
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let pair = test_key_pair();
        let mut signed = sign_data(b"authenticated payload".to_vec(), &pair).unwrap();
        signed.message_raw_data[0] ^= 0xff;
        let result = verify_data(&signed, &pair.public_key_der().unwrap());
        assert!(matches!(result, Err(CryptoError::SignatureMismatch)));
    }

    #[test]
    fn aes_roundtrip_with_fresh_nonces() {
        let secret = Guid::random();
        let (nonce1, cipher1) = encrypt_payload(&secret, b"hello").unwrap();
        let (nonce2, cipher2) = encrypt_payload(&secret, b"hello").unwrap();
        assert_eq!(nonce1.len(), AES_NONCE_SIZE);
        assert_ne!(nonce1, nonce2);
        assert_ne!(cipher1, cipher2);

        let nonce: [u8; AES_NONCE_SIZE] = nonce1.as_slice().try_into().unwrap();
        let plain = decrypt_payload(&secret, &nonce, &cipher1).unwrap();
        assert_eq!(plain, b"hello");
    }

    #[test]
    fn aes_wrong_key_fails() {
        let secret = Guid::random();
        let (nonce, ciphertext) = encrypt_payload(&secret, b"hello").unwrap();
        let nonce: [u8; AES_NONCE_SIZE] = nonce.as_slice().try_into().unwrap();
        let result = decrypt_payload(&Guid::random(), &nonce, &ciphertext);
        assert!(matches!(result, Err(CryptoError::Decrypt)));
    }

    #[test]
    fn empty_payload_is_legal() {
        let secret = Guid::random();
        let (nonce, ciphertext) = encrypt_payload(&secret, b"").unwrap();
        let nonce: [u8; AES_NONCE_SIZE] = nonce.as_slice().try_into().unwrap();
        assert_eq!(decrypt_payload(&secret, &nonce, &ciphertext).unwrap(), b"");
    }
}
