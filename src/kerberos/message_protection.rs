//! Per-message tokens of [RFC 4121 section 4.2](https://datatracker.ietf.org/doc/html/rfc4121#section-4.2).

use bitflags::bitflags;
use picky_krb::constants::key_usages::{ACCEPTOR_SEAL, ACCEPTOR_SIGN, INITIATOR_SEAL, INITIATOR_SIGN};
use picky_krb::crypto::CipherSuite;
use picky_krb::gss_api::{MicToken, WrapToken};
use subtle::ConstantTimeEq;

use crate::crypto::{checksum_type_for, KerberosCrypto};
use crate::{Error, ErrorKind, Result};

/// Both token headers are 16 bytes long.
pub const TOKEN_HEADER_LEN: usize = 16;

bitflags! {
    /// [Flags Field](https://datatracker.ietf.org/doc/html/rfc4121#section-4.2.2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TokenFlags: u8 {
        const SENT_BY_ACCEPTOR = 0x01;
        /// Set in Wrap tokens only.
        const SEALED = 0x02;
        const ACCEPTOR_SUBKEY = 0x04;
    }
}

/// Key material protecting the messages of an established context.
#[derive(Debug, Clone, Copy)]
pub struct ProtectionKey<'a> {
    pub crypto: &'a dyn KerberosCrypto,
    pub encryption_type: &'a CipherSuite,
    pub key: &'a [u8],
    /// The key is the sub-key chosen by the acceptor.
    pub acceptor_subkey: bool,
}

impl ProtectionKey<'_> {
    fn flags(&self, is_initiator: bool) -> TokenFlags {
        let mut flags = TokenFlags::empty();
        if !is_initiator {
            flags |= TokenFlags::SENT_BY_ACCEPTOR;
        }
        if self.acceptor_subkey {
            flags |= TokenFlags::ACCEPTOR_SUBKEY;
        }

        flags
    }
}

fn sign_key_usage(sent_by_initiator: bool) -> i32 {
    if sent_by_initiator {
        INITIATOR_SIGN
    } else {
        ACCEPTOR_SIGN
    }
}

fn seal_key_usage(sent_by_initiator: bool) -> i32 {
    if sent_by_initiator {
        INITIATOR_SEAL
    } else {
        ACCEPTOR_SEAL
    }
}

/// Checks that a received token was sent by the peer.
fn check_direction(flags: TokenFlags, is_initiator: bool) -> Result<()> {
    if flags.contains(TokenFlags::SENT_BY_ACCEPTOR) != is_initiator {
        return Err(Error::new(
            ErrorKind::ValidationFailure,
            "invalid token SentByAcceptor flag: the token was not sent by the peer",
        ));
    }

    Ok(())
}

/// Builds a MIC token over `data`: the header followed by the keyed checksum of `data | header`.
#[instrument(level = "trace", skip(data, key))]
pub fn generate_mic_token(is_initiator: bool, seq_number: u64, data: &[u8], key: &ProtectionKey<'_>) -> Result<Vec<u8>> {
    let mic_token = if is_initiator {
        MicToken::with_initiator_flags()
    } else {
        MicToken::with_acceptor_flags()
    };
    let mut mic_token = mic_token.with_seq_number(seq_number);
    mic_token.flags = key.flags(is_initiator).bits();

    let mut payload = data.to_vec();
    payload.extend_from_slice(&mic_token.header());

    mic_token.set_checksum(key.crypto.checksum(
        key.key,
        &payload,
        sign_key_usage(is_initiator),
        &checksum_type_for(key.encryption_type)?,
    )?);

    let mut mic_token_raw = Vec::with_capacity(TOKEN_HEADER_LEN + mic_token.checksum.len());
    mic_token.encode(&mut mic_token_raw)?;

    Ok(mic_token_raw)
}

/// Validates a MIC token received from the peer and returns its sequence number.
///
/// Fails with [ErrorKind::ValidationFailure] when the checksum does not match.
#[instrument(level = "trace", skip(token, data, key))]
pub fn validate_mic_token(is_initiator: bool, token: &[u8], data: &[u8], key: &ProtectionKey<'_>) -> Result<u64> {
    if token.len() <= TOKEN_HEADER_LEN {
        return Err(Error::new(ErrorKind::FormatError, "MIC token is too short"));
    }

    let mic_token = MicToken::decode(token)?;
    let flags = TokenFlags::from_bits_retain(mic_token.flags);

    check_direction(flags, is_initiator)?;
    if flags.contains(TokenFlags::SEALED) {
        return Err(Error::new(
            ErrorKind::FormatError,
            "the Sealed flag must not be set in the MIC token",
        ));
    }

    let mut payload = data.to_vec();
    payload.extend_from_slice(&mic_token.header());

    let expected = key.crypto.checksum(
        key.key,
        &payload,
        sign_key_usage(!is_initiator),
        &checksum_type_for(key.encryption_type)?,
    )?;

    if !bool::from(expected.ct_eq(&mic_token.checksum)) {
        return Err(Error::new(ErrorKind::ValidationFailure, "bad checksum of the MIC token"));
    }

    Ok(mic_token.seq_num)
}

/// Sealed message split between the token and the data buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedMessage {
    /// Wrap token header followed by the leading RRC bytes of the rotated ciphertext.
    pub token: Vec<u8>,
    /// Remaining ciphertext. Same length as the plaintext.
    pub data: Vec<u8>,
}

/// Seals `plaintext` into a Wrap token.
///
/// The token carries no filler (EC = 0) and the ciphertext is rotated right by the trailer length
/// (RRC = ciphertext length - plaintext length) so that the data keeps its length in place.
#[instrument(level = "trace", skip(plaintext, key))]
pub fn wrap_message(
    is_initiator: bool,
    seq_number: u64,
    plaintext: &[u8],
    key: &ProtectionKey<'_>,
) -> Result<WrappedMessage> {
    let mut wrap_token = WrapToken::with_seq_number(seq_number);
    wrap_token.flags = (key.flags(is_initiator) | TokenFlags::SEALED).bits();

    // the encrypted copy of the header has RRC set to zero
    let mut payload = plaintext.to_vec();
    payload.extend_from_slice(&wrap_token.header());

    let mut encrypted = key.crypto.encrypt(
        key.encryption_type,
        key.key,
        &payload,
        seal_key_usage(is_initiator),
    )?;

    let rrc = encrypted.len() - plaintext.len();
    encrypted.rotate_right(rrc);

    wrap_token.set_rrc(
        u16::try_from(rrc).map_err(|_| Error::new(ErrorKind::InternalError, "RRC does not fit into 16 bits"))?,
    );
    wrap_token.set_checksum(encrypted);

    let mut token = Vec::with_capacity(TOKEN_HEADER_LEN + wrap_token.checksum.len());
    wrap_token.encode(&mut token)?;

    let data = token.split_off(TOKEN_HEADER_LEN + rrc);

    Ok(WrappedMessage { token, data })
}

/// Opens a Wrap token received from the peer. Returns its sequence number and the plaintext.
///
/// Fails with [ErrorKind::ValidationFailure] when the integrity check does not pass.
#[instrument(level = "trace", skip(token, data, key))]
pub fn unwrap_message(is_initiator: bool, token: &[u8], data: &[u8], key: &ProtectionKey<'_>) -> Result<(u64, Vec<u8>)> {
    if token.len() < TOKEN_HEADER_LEN {
        return Err(Error::new(ErrorKind::FormatError, "Wrap token is too short"));
    }

    let mut raw_wrap_token = token.to_vec();
    raw_wrap_token.extend_from_slice(data);

    let wrap_token = WrapToken::decode(raw_wrap_token.as_slice())?;
    let flags = TokenFlags::from_bits_retain(wrap_token.flags);

    check_direction(flags, is_initiator)?;
    if !flags.contains(TokenFlags::SEALED) {
        return Err(Error::new(
            ErrorKind::ProtocolViolation,
            "Wrap tokens without confidentiality are not supported",
        ));
    }

    let mut encrypted = wrap_token.checksum.clone();
    if encrypted.is_empty() {
        return Err(Error::new(ErrorKind::FormatError, "Wrap token has no ciphertext"));
    }

    // some acceptors also count the filler in the rotation
    let rotation = (usize::from(wrap_token.rrc) + usize::from(wrap_token.ec)) % encrypted.len();
    encrypted.rotate_left(rotation);

    let decrypted = key.crypto.decrypt(
        key.encryption_type,
        key.key,
        &encrypted,
        seal_key_usage(!is_initiator),
    )?;

    let trailer_len = usize::from(wrap_token.ec) + WrapToken::header_len();
    if decrypted.len() < trailer_len {
        return Err(Error::new(ErrorKind::FormatError, "decrypted Wrap token is too short"));
    }

    let plaintext_len = decrypted.len() - trailer_len;
    let encrypted_header = WrapToken {
        rrc: 0,
        ..wrap_token.clone()
    }
    .header();
    if decrypted[plaintext_len + usize::from(wrap_token.ec)..] != encrypted_header[..] {
        return Err(Error::new(
            ErrorKind::ValidationFailure,
            "encrypted Wrap token header does not match the token header",
        ));
    }

    Ok((wrap_token.seq_num, decrypted[..plaintext_len].to_vec()))
}
