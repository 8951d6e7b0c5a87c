use std::fmt::Debug;

use picky_krb::crypto::{ChecksumSuite, CipherSuite};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::{Error, ErrorKind, Result, Secret};

/// Symmetric cryptography used by the Kerberos exchanges (RFC 3961, RFC 3962).
///
/// Keys are raw protocol keys of the size defined by the encryption type.
pub trait KerberosCrypto: Debug + Send + Sync {
    /// Derives the long-term key from the account password (string-to-key).
    fn derive_key(&self, password: &[u8], salt: &[u8], encryption_type: &CipherSuite) -> Result<Secret<Vec<u8>>>;

    fn encrypt(&self, encryption_type: &CipherSuite, key: &[u8], plaintext: &[u8], key_usage: i32) -> Result<Vec<u8>>;

    /// Fails with [ErrorKind::ValidationFailure] when the integrity check does not pass.
    fn decrypt(&self, encryption_type: &CipherSuite, key: &[u8], ciphertext: &[u8], key_usage: i32) -> Result<Vec<u8>>;

    fn checksum(&self, key: &[u8], data: &[u8], key_usage: i32, checksum_type: &ChecksumSuite) -> Result<Vec<u8>>;

    /// Generates a fresh random key (session sub-key) of the encryption type.
    fn generate_key(&self, encryption_type: &CipherSuite) -> Result<Secret<Vec<u8>>>;
}

/// [KerberosCrypto] implementation backed by the `picky-krb` ciphers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PickyCrypto;

impl KerberosCrypto for PickyCrypto {
    fn derive_key(&self, password: &[u8], salt: &[u8], encryption_type: &CipherSuite) -> Result<Secret<Vec<u8>>> {
        let key = encryption_type.cipher().generate_key_from_password(password, salt)?;

        Ok(key.into())
    }

    fn encrypt(&self, encryption_type: &CipherSuite, key: &[u8], plaintext: &[u8], key_usage: i32) -> Result<Vec<u8>> {
        Ok(encryption_type.cipher().encrypt(key, key_usage, plaintext)?)
    }

    fn decrypt(&self, encryption_type: &CipherSuite, key: &[u8], ciphertext: &[u8], key_usage: i32) -> Result<Vec<u8>> {
        Ok(encryption_type.cipher().decrypt(key, key_usage, ciphertext)?)
    }

    fn checksum(&self, key: &[u8], data: &[u8], key_usage: i32, checksum_type: &ChecksumSuite) -> Result<Vec<u8>> {
        Ok(checksum_type.hasher().checksum(key, key_usage, data)?)
    }

    fn generate_key(&self, encryption_type: &CipherSuite) -> Result<Secret<Vec<u8>>> {
        let mut key = vec![0; encryption_type.cipher().key_size()];
        OsRng.fill_bytes(&mut key);

        Ok(key.into())
    }
}

/// Keyed checksum type matching the encryption type (RFC 3962 section 7).
pub fn checksum_type_for(encryption_type: &CipherSuite) -> Result<ChecksumSuite> {
    let checksum_type: usize = match encryption_type {
        CipherSuite::Aes256CtsHmacSha196 => 16,
        CipherSuite::Aes128CtsHmacSha196 => 15,
        CipherSuite::Des3CbcSha1Kd => 12,
    };

    ChecksumSuite::try_from(checksum_type).map_err(|err| {
        Error::new(
            ErrorKind::InternalError,
            format!("checksum type {} is not supported: {:?}", checksum_type, err),
        )
    })
}

/// Numeric encryption type identifier (RFC 3961 section 8).
pub fn etype_id(encryption_type: &CipherSuite) -> u8 {
    encryption_type.into()
}

/// Parses an encryption type received from the peer. Only the AES types are accepted.
pub fn cipher_suite_from_id(etype: &[u8]) -> Result<CipherSuite> {
    match CipherSuite::try_from(etype) {
        Ok(cipher_suite @ (CipherSuite::Aes256CtsHmacSha196 | CipherSuite::Aes128CtsHmacSha196)) => Ok(cipher_suite),
        Ok(cipher_suite) => Err(Error::new(
            ErrorKind::ProtocolViolation,
            format!("encryption type {:?} is not allowed", cipher_suite),
        )),
        Err(err) => Err(Error::new(
            ErrorKind::ProtocolViolation,
            format!("unsupported encryption type {:?}: {:?}", etype, err),
        )),
    }
}
