use picky_asn1::wrapper::Asn1SequenceOf;
use picky_krb::constants::key_usages::{AP_REP_ENC, AS_REP_ENC, TGS_REP_ENC_SESSION_KEY};
use picky_krb::constants::types::PA_ETYPE_INFO2_TYPE;
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{EncApRepPart, EncryptionKey, EtypeInfo2, KrbResult, PaData, ResultExt};
use picky_krb::messages::{ApRep, AsRep, EncAsRepPart, EncKdcRepPart, EncTgsRepPart, KrbError, TgsRep};
use serde::Deserialize;

use crate::crypto::KerberosCrypto;
use crate::kerberos::context::AuthenticatorTime;
use crate::{Error, ErrorKind, Result};

/// Encryption type and salt advertised by the KDC in PA-ETYPE-INFO2.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KdcEncryptionParams {
    pub encryption_type: Option<u8>,
    pub salt: Option<String>,
}

/// Decodes a KDC reply that is either the expected message or a KRB-ERROR.
pub fn parse_kdc_reply<T>(reply: &[u8]) -> Result<KrbResult<T>>
where
    T: for<'de> Deserialize<'de>,
{
    let mut d = picky_asn1_der::Deserializer::new_from_bytes(reply);

    Ok(<KrbResult<T> as ResultExt<T>>::deserialize(&mut d)?)
}

pub fn krb_error_code(error: &KrbError) -> u32 {
    error.0.error_code.0
}

/// Turns a KRB-ERROR received where a reply was expected into an error.
pub fn unexpected_krb_error(error: &KrbError, exchange: &str) -> Error {
    let e_text = error
        .0
        .e_text
        .0
        .as_ref()
        .map(|e_text| e_text.0.to_string())
        .unwrap_or_default();

    Error::new(
        ErrorKind::ProtocolViolation,
        format!(
            "KDC rejected the {} request with error code {}: {}",
            exchange,
            krb_error_code(error),
            e_text
        ),
    )
}

fn find_etype_info2(pa_datas: &[PaData]) -> Result<Option<KdcEncryptionParams>> {
    let pa_etype_info2 = match pa_datas
        .iter()
        .find(|pa_data| pa_data.padata_type.0 .0 == PA_ETYPE_INFO2_TYPE)
    {
        Some(pa_data) => pa_data,
        None => return Ok(None),
    };

    let etype_info2: EtypeInfo2 = picky_asn1_der::from_bytes(&pa_etype_info2.padata_data.0 .0)?;

    Ok(etype_info2.0.first().map(|entry| KdcEncryptionParams {
        encryption_type: entry.etype.0 .0.last().copied(),
        salt: entry.salt.0.as_ref().map(|salt| salt.0.to_string()),
    }))
}

/// Extracts PA-ETYPE-INFO2 from the e-data of the KDC_ERR_PREAUTH_REQUIRED error.
pub fn extract_encryption_params_from_krb_error(error: &KrbError) -> Result<Option<KdcEncryptionParams>> {
    trace!(?error, "KRB_ERROR");

    match error.0.e_data.0.as_ref() {
        Some(e_data) => {
            let pa_datas: Asn1SequenceOf<PaData> = picky_asn1_der::from_bytes(&e_data.0 .0)?;

            find_etype_info2(&pa_datas.0)
        }
        None => Ok(None),
    }
}

#[instrument(level = "trace", ret, skip_all)]
pub fn extract_encryption_params_from_as_rep(as_rep: &AsRep) -> Result<Option<KdcEncryptionParams>> {
    match as_rep.0.padata.0.as_ref() {
        Some(pa_datas) => find_etype_info2(&pa_datas.0 .0),
        None => Ok(None),
    }
}

/// Converts an unsigned big-endian integer of at most four significant bytes.
pub fn integer_to_u32(bytes: &[u8]) -> Result<u32> {
    let significant = match bytes.iter().position(|b| *b != 0) {
        Some(start) => &bytes[start..],
        None => &[],
    };

    if significant.len() > 4 {
        return Err(Error::new(
            ErrorKind::FormatError,
            format!("integer does not fit into 32 bits: {:?}", bytes),
        ));
    }

    Ok(significant.iter().fold(0, |value, b| (value << 8) | u32::from(*b)))
}

fn check_nonce(enc_part: &EncKdcRepPart, nonce: u32) -> Result<()> {
    let reply_nonce = integer_to_u32(&enc_part.nonce.0 .0)?;

    if reply_nonce != nonce {
        return Err(Error::new(
            ErrorKind::ValidationFailure,
            format!("KDC reply nonce {} does not match the request nonce {}", reply_nonce, nonce),
        ));
    }

    Ok(())
}

// Some KDCs return an EncTgsRepPart in the AS-REP and the other way round.
fn decode_enc_kdc_rep_part(data: &[u8]) -> Result<EncKdcRepPart> {
    match picky_asn1_der::from_bytes::<EncAsRepPart>(data) {
        Ok(enc_as_rep_part) => Ok(enc_as_rep_part.0),
        Err(_) => Ok(picky_asn1_der::from_bytes::<EncTgsRepPart>(data)?.0),
    }
}

/// Decrypts the AS-REP encrypted part with the long-term key and checks its nonce.
#[instrument(level = "trace", skip_all)]
pub fn decrypt_as_rep(
    crypto: &dyn KerberosCrypto,
    as_rep: &AsRep,
    key: &[u8],
    encryption_type: &CipherSuite,
    nonce: u32,
) -> Result<EncKdcRepPart> {
    let enc_data = crypto.decrypt(encryption_type, key, &as_rep.0.enc_part.0.cipher.0 .0, AS_REP_ENC)?;
    let enc_part = decode_enc_kdc_rep_part(&enc_data)?;

    check_nonce(&enc_part, nonce)?;

    Ok(enc_part)
}

/// Decrypts the TGS-REP encrypted part with the TGT session key and checks its nonce.
#[instrument(level = "trace", skip_all)]
pub fn decrypt_tgs_rep(
    crypto: &dyn KerberosCrypto,
    tgs_rep: &TgsRep,
    session_key: &[u8],
    encryption_type: &CipherSuite,
    nonce: u32,
) -> Result<EncKdcRepPart> {
    let enc_data = crypto.decrypt(
        encryption_type,
        session_key,
        &tgs_rep.0.enc_part.0.cipher.0 .0,
        TGS_REP_ENC_SESSION_KEY,
    )?;
    let enc_part = match picky_asn1_der::from_bytes::<EncTgsRepPart>(&enc_data) {
        Ok(enc_tgs_rep_part) => enc_tgs_rep_part.0,
        Err(_) => picky_asn1_der::from_bytes::<EncAsRepPart>(&enc_data)?.0,
    };

    check_nonce(&enc_part, nonce)?;

    Ok(enc_part)
}

pub fn decrypt_ap_rep(
    crypto: &dyn KerberosCrypto,
    ap_rep: &ApRep,
    session_key: &[u8],
    encryption_type: &CipherSuite,
) -> Result<EncApRepPart> {
    let enc_data = crypto.decrypt(encryption_type, session_key, &ap_rep.0.enc_part.0.cipher.0 .0, AP_REP_ENC)?;

    Ok(picky_asn1_der::from_bytes(&enc_data)?)
}

/// Result of the mutual authentication check.
#[derive(Debug)]
pub struct ValidatedApRep {
    pub seq_number: u32,
    pub subkey: Option<EncryptionKey>,
}

/// Checks that the AP-REP echoes the authenticator timestamp and carries a positive sequence number.
pub fn validate_ap_rep(enc_ap_rep_part: EncApRepPart, authenticator_time: &AuthenticatorTime) -> Result<ValidatedApRep> {
    let enc_ap_rep_part = enc_ap_rep_part.0;

    if enc_ap_rep_part.ctime.0 != authenticator_time.ctime {
        return Err(Error::new(
            ErrorKind::ValidationFailure,
            "AP_REP ctime does not match the authenticator ctime",
        ));
    }

    let cusec = integer_to_u32(&enc_ap_rep_part.cusec.0 .0)
        .map_err(|_| Error::new(ErrorKind::ValidationFailure, "AP_REP cusec is not valid"))?;
    if cusec != authenticator_time.cusec {
        return Err(Error::new(
            ErrorKind::ValidationFailure,
            format!(
                "AP_REP cusec {} does not match the authenticator cusec {}",
                cusec, authenticator_time.cusec
            ),
        ));
    }

    let seq_number = enc_ap_rep_part
        .seq_number
        .0
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::ValidationFailure, "AP_REP sequence number is missing"))?;
    let seq_number = &seq_number.0 .0;
    // negative in two's complement
    if seq_number.first().map(|b| b & 0x80 != 0).unwrap_or(false) {
        return Err(Error::new(ErrorKind::ValidationFailure, "AP_REP sequence number is negative"));
    }
    let seq_number = integer_to_u32(seq_number)
        .map_err(|_| Error::new(ErrorKind::ValidationFailure, "AP_REP sequence number is too large"))?;
    if seq_number == 0 {
        return Err(Error::new(ErrorKind::ValidationFailure, "AP_REP sequence number is zero"));
    }

    Ok(ValidatedApRep {
        seq_number,
        subkey: enc_ap_rep_part.subkey.0.map(|subkey| subkey.0),
    })
}
