use picky_krb::constants::error_codes::KDC_ERR_PREAUTH_REQUIRED;
use picky_krb::crypto::CipherSuite;
use picky_krb::messages::AsRep;
use rand::rngs::OsRng;
use rand::Rng;

use super::extractors::{
    decrypt_as_rep, extract_encryption_params_from_as_rep, extract_encryption_params_from_krb_error, krb_error_code,
    parse_kdc_reply, unexpected_krb_error, KdcEncryptionParams,
};
use super::generators::{
    client_principal_name, generate_as_req, generate_as_req_kdc_body, generate_pa_datas_for_as_req,
    GenerateAsPaDataOptions, GenerateAsReqOptions,
};
use super::{expect_reply_kind, send_and_expect};
use crate::crypto::{cipher_suite_from_id, etype_id};
use crate::kerberos::{KerberosClient, KerberosState};
use crate::transport::PduKind;
use crate::{Error, ErrorKind, Result, Secret};

/// Picks the first supported encryption type, or the one advertised by the KDC when it is supported.
fn select_encryption_type(supported: &[CipherSuite], advertised: Option<u8>) -> Result<CipherSuite> {
    if let Some(advertised) = advertised {
        if let Some(encryption_type) = supported.iter().find(|etype| etype_id(etype) == advertised) {
            return Ok(encryption_type.clone());
        }

        warn!(advertised, "KDC advertised an unsupported encryption type");
    }

    supported
        .first()
        .cloned()
        .ok_or_else(|| Error::new(ErrorKind::InvalidParameter, "no encryption type is supported"))
}

/// Performs AS exchange as specified in [RFC 4120: The Authentication Service Exchange](https://www.rfc-editor.org/rfc/rfc4120#section-3.1).
///
/// The first AS-REQ is sent without pre-authentication data and must be answered with
/// KDC_ERR_PREAUTH_REQUIRED. The second one carries the encrypted timestamp.
#[instrument(level = "debug", skip_all, fields(realm = %client.context.realm))]
pub(super) fn as_exchange(client: &mut KerberosClient) -> Result<()> {
    let realm = client.context.realm.clone();
    let cname = client_principal_name(&client.credentials.account_name)?;
    let nonce = OsRng.gen::<u32>();

    let kdc_req_body = generate_as_req_kdc_body(&GenerateAsReqOptions {
        realm: &realm,
        cname: &cname,
        nonce,
        hostname: client.config.client_computer_name.as_deref(),
        encryption_types: &client.context.supported_encryption_types,
    })?;

    let as_req = generate_as_req(None, kdc_req_body.clone());
    let reply = send_and_expect(client, &picky_asn1_der::to_vec(&as_req)?, PduKind::AsRep)?;
    expect_reply_kind(&reply, PduKind::AsRep)?;

    let krb_error = match parse_kdc_reply::<AsRep>(&reply)? {
        Ok(_) => {
            error!("KDC replied with AS_REP to the AS_REQ without the encrypted timestamp. The KRB_ERROR expected.");

            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                "KDC issued a ticket without pre-authentication",
            ));
        }
        Err(krb_error) => krb_error,
    };

    if krb_error_code(&krb_error) != KDC_ERR_PREAUTH_REQUIRED {
        return Err(unexpected_krb_error(&krb_error, "AS"));
    }
    client.state = KerberosState::PreauthPending;

    let kdc_params = match extract_encryption_params_from_krb_error(&krb_error)? {
        Some(params) => {
            debug!(?params, "Encryption params extracted from the KRB_ERROR");
            params
        }
        None => {
            warn!("KRB_ERROR does not contain PA-ETYPE-INFO2. Using the default salt and encryption type");
            KdcEncryptionParams::default()
        }
    };

    let encryption_type = select_encryption_type(&client.context.supported_encryption_types, kdc_params.encryption_type)?;
    let salt = client
        .config
        .salt
        .clone()
        .or(kdc_params.salt)
        .unwrap_or_else(|| client.credentials.salt());

    let key = client
        .crypto
        .derive_key(client.credentials.password.as_bytes(), salt.as_bytes(), &encryption_type)?;

    let pa_datas = generate_pa_datas_for_as_req(&GenerateAsPaDataOptions {
        key: &key,
        encryption_type: &encryption_type,
        crypto: client.crypto.as_ref(),
    })?;

    let as_req = generate_as_req(Some(pa_datas), kdc_req_body);
    let reply = send_and_expect(client, &picky_asn1_der::to_vec(&as_req)?, PduKind::AsRep)?;
    expect_reply_kind(&reply, PduKind::AsRep)?;

    let as_rep = parse_kdc_reply::<AsRep>(&reply)?.map_err(|krb_error| {
        error!(error_code = krb_error_code(&krb_error), "AS exchange error");

        unexpected_krb_error(&krb_error, "AS")
    })?;

    // The reply key depends on the etype and salt the KDC actually used.
    let reply_encryption_type = cipher_suite_from_id(&as_rep.0.enc_part.0.etype.0 .0)?;
    let reply_salt = match (&client.config.salt, extract_encryption_params_from_as_rep(&as_rep)?) {
        (None, Some(KdcEncryptionParams { salt: Some(salt), .. })) => salt,
        _ => salt.clone(),
    };

    let key = if etype_id(&reply_encryption_type) != etype_id(&encryption_type) || reply_salt != salt {
        debug!(
            encryption_type = etype_id(&reply_encryption_type),
            "AS_REP is encrypted with other key parameters. Deriving the reply key again"
        );

        client.crypto.derive_key(
            client.credentials.password.as_bytes(),
            reply_salt.as_bytes(),
            &reply_encryption_type,
        )?
    } else {
        key
    };

    let enc_part = decrypt_as_rep(
        client.crypto.as_ref(),
        &as_rep,
        key.as_ref(),
        &reply_encryption_type,
        nonce,
    )?;

    let session_key_type = cipher_suite_from_id(&enc_part.key.0.key_type.0 .0)?;
    let as_rep = as_rep.0;

    client.context.realm = as_rep.crealm.0.to_string();
    client.context.cname = Some(as_rep.cname.0);
    client.context.ticket = Some(as_rep.ticket.0);
    client.context.session_key = Some(Secret::from(enc_part.key.0.key_value.0 .0));
    client.context.encryption_type = Some(session_key_type);
    client.state = KerberosState::AsIssued;

    debug!(realm = %client.context.realm, "TGT obtained");

    Ok(())
}
