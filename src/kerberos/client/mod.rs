mod as_exchange;
pub mod extractors;
pub mod generators;

use picky_krb::constants::key_usages::{AP_REQ_AUTHENTICATOR, TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR};
use picky_krb::messages::{ApRep, KrbError, TgsRep};
use rand::rngs::OsRng;
use rand::Rng;

use self::extractors::{
    decrypt_ap_rep, decrypt_tgs_rep, integer_to_u32, krb_error_code, parse_kdc_reply, unexpected_krb_error,
    validate_ap_rep,
};
use self::generators::{
    generate_ap_rep, generate_ap_req, generate_authenticator, generate_tgs_req, generate_tgs_req_kdc_body,
    AuthenticatorChecksum, EncKey, GenerateApRepOptions, GenerateApReqOptions, GenerateAuthenticatorOptions,
    GenerateTgsReqOptions,
};
use crate::crypto::{checksum_type_for, cipher_suite_from_id};
use crate::kerberos::cache::CachedTicket;
use crate::kerberos::context::AuthenticatorTime;
use crate::kerberos::flags::{map_context_requirements, ApOptions, ClientRequestFlags};
use crate::kerberos::gss_token::{self, TokenId, TokenProfile};
use crate::kerberos::{KerberosClient, KerberosState};
use crate::transport::PduKind;
use crate::{
    CredentialIdentity, Error, ErrorKind, InitializeSecurityContextResult, Result, Secret, SecurityStatus,
};

/// Upper bound (exclusive) of the initial local sequence number.
const MAX_INITIAL_SEQ_NUMBER: u32 = 0x7fff_ffff;

/// First byte of a SPNEGO NegTokenResp.
const NEG_TOKEN_RESP_TAG: u8 = 0xa1;

fn missing(what: &str) -> Error {
    Error::new(ErrorKind::ResourceError, format!("{} is not set in the Kerberos context", what))
}

/// Sends the PDU to the KDC and waits for the reply within the configured timeout.
fn send_and_expect(client: &mut KerberosClient, pdu: &[u8], expected: PduKind) -> Result<Vec<u8>> {
    client.transport.send(pdu)?;

    client.transport.expect(client.config.timeout, expected)
}

/// Only the expected reply and KRB-ERROR are valid answers.
fn expect_reply_kind(reply: &[u8], expected: PduKind) -> Result<()> {
    match PduKind::from_pdu(reply) {
        Some(kind) if kind == expected || kind == PduKind::KrbError => Ok(()),
        kind => Err(Error::new(
            ErrorKind::ProtocolViolation,
            format!("expected {:?} or KRB_ERROR but got {:?}", expected, kind),
        )),
    }
}

/// Single entry point of the context state machine.
pub(crate) fn initialize_security_context(
    client: &mut KerberosClient,
    input_token: Option<&[u8]>,
) -> Result<InitializeSecurityContextResult> {
    match (client.state, input_token) {
        (KerberosState::Uninitialized | KerberosState::Established, None) => start_exchange(client),
        (KerberosState::ContinuePending, Some(input_token)) => continue_exchange(client, input_token),
        (state, input_token) => Err(Error::new(
            ErrorKind::OutOfSequence,
            format!(
                "Initialize {} an input token is not allowed in the {:?} state",
                if input_token.is_some() { "with" } else { "without" },
                state
            ),
        )),
    }
}

#[instrument(level = "debug", skip_all)]
fn start_exchange(client: &mut KerberosClient) -> Result<InitializeSecurityContextResult> {
    client.reset();

    let identity = client.credentials.identity();

    match client.cache.get(&identity, &client.target_name)? {
        Some(cached_ticket) => {
            debug!(target_name = %client.target_name, "Using the cached service ticket");

            restore_from_cache(client, cached_ticket);
        }
        None => {
            as_exchange::as_exchange(client)?;
            tgs_exchange(client, &identity)?;
        }
    }

    ap_exchange(client)
}

fn restore_from_cache(client: &mut KerberosClient, cached_ticket: CachedTicket) {
    let CachedTicket {
        ticket,
        session_key,
        encryption_type,
        crealm,
        cname,
    } = cached_ticket;

    client.context.realm = crealm;
    client.context.cname = Some(cname);
    client.context.ticket = Some(ticket);
    client.context.ap_session_key = Some(session_key.clone());
    client.context.session_key = Some(session_key);
    client.context.encryption_type = Some(encryption_type);
    client.state = KerberosState::TgsIssued;
}

/// Performs TGS exchange as specified in [RFC 4120: The Ticket-Granting Service (TGS) Exchange](https://www.rfc-editor.org/rfc/rfc4120#section-3.3)
/// and stores the service ticket into the cache.
#[instrument(level = "debug", skip_all, fields(target_name = %client.target_name))]
fn tgs_exchange(client: &mut KerberosClient, identity: &CredentialIdentity) -> Result<()> {
    let realm = client.context.realm.clone();
    let tgt = client.context.ticket.clone().ok_or_else(|| missing("TGT"))?;
    let session_key = client.context.session_key.clone().ok_or_else(|| missing("AS session key"))?;
    let encryption_type = client
        .context
        .encryption_type
        .clone()
        .ok_or_else(|| missing("encryption type"))?;
    let cname = client.context.cname.clone().ok_or_else(|| missing("client name"))?;
    let nonce = OsRng.gen::<u32>();

    let kdc_req_body = generate_tgs_req_kdc_body(&GenerateTgsReqOptions {
        realm: &realm,
        service_principal: &client.target_name,
        nonce,
        encryption_types: &client.context.supported_encryption_types,
    })?;
    let encoded_kdc_req_body = picky_asn1_der::to_vec(&kdc_req_body)?;

    let authenticator = generate_authenticator(GenerateAuthenticatorOptions {
        crealm: &realm,
        cname: &cname,
        seq_num: None,
        sub_key: None,
        checksum: AuthenticatorChecksum::Standard {
            checksum_type: checksum_type_for(&encryption_type)?,
            bound_data: &encoded_kdc_req_body,
        },
        session_key: &session_key,
        crypto: client.crypto.as_ref(),
    })?;

    let pa_tgs_req = generate_ap_req(GenerateApReqOptions {
        ticket: tgt,
        session_key: &session_key,
        encryption_type: &encryption_type,
        authenticator: &authenticator,
        options: ApOptions::empty(),
        key_usage: TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR,
        crypto: client.crypto.as_ref(),
    })?;

    let tgs_req = generate_tgs_req(kdc_req_body, &pa_tgs_req)?;

    let reply = send_and_expect(client, &picky_asn1_der::to_vec(&tgs_req)?, PduKind::TgsRep)?;
    expect_reply_kind(&reply, PduKind::TgsRep)?;

    let tgs_rep = parse_kdc_reply::<TgsRep>(&reply)?.map_err(|krb_error| {
        error!(error_code = krb_error_code(&krb_error), "TGS exchange error");

        unexpected_krb_error(&krb_error, "TGS")
    })?;

    let enc_part = decrypt_tgs_rep(
        client.crypto.as_ref(),
        &tgs_rep,
        session_key.as_ref(),
        &encryption_type,
        nonce,
    )?;

    let service_encryption_type = cipher_suite_from_id(&enc_part.key.0.key_type.0 .0)?;
    let service_session_key = Secret::from(enc_part.key.0.key_value.0 .0);
    let ticket = tgs_rep.0.ticket.0;

    client.context.ticket = Some(ticket.clone());
    client.context.session_key = Some(service_session_key.clone());
    client.context.ap_session_key = Some(service_session_key.clone());
    client.context.encryption_type = Some(service_encryption_type.clone());
    client.state = KerberosState::TgsIssued;

    client.cache.put(
        identity,
        &client.target_name,
        CachedTicket {
            ticket,
            session_key: service_session_key,
            encryption_type: service_encryption_type,
            crealm: realm,
            cname,
        },
    )?;

    debug!("Service ticket obtained");

    Ok(())
}

/// Builds the AP-REQ token ([RFC 4120 3.2](https://www.rfc-editor.org/rfc/rfc4120#section-3.2)).
#[instrument(level = "debug", skip_all)]
fn ap_exchange(client: &mut KerberosClient) -> Result<InitializeSecurityContextResult> {
    let (ap_options, checksum_flags) = map_context_requirements(client.context_requirements);
    client.context.ap_options = ap_options;
    client.context.checksum_flags = checksum_flags;

    let ticket = client.context.ticket.clone().ok_or_else(|| missing("service ticket"))?;
    let ap_session_key = client
        .context
        .ap_session_key
        .clone()
        .ok_or_else(|| missing("AP session key"))?;
    let encryption_type = client
        .context
        .encryption_type
        .clone()
        .ok_or_else(|| missing("encryption type"))?;
    let cname = client.context.cname.clone().ok_or_else(|| missing("client name"))?;

    let sub_key = EncKey {
        key_type: encryption_type.clone(),
        key_value: client.crypto.generate_key(&encryption_type)?,
    };
    let seq_number = OsRng.gen_range(1..MAX_INITIAL_SEQ_NUMBER);
    client.context.local_seq_number = u64::from(seq_number);

    let authenticator = generate_authenticator(GenerateAuthenticatorOptions {
        crealm: &client.context.realm,
        cname: &cname,
        seq_num: Some(seq_number),
        sub_key: Some(&sub_key),
        checksum: AuthenticatorChecksum::Gss8003(checksum_flags),
        session_key: &ap_session_key,
        crypto: client.crypto.as_ref(),
    })?;

    client.context.authenticator_time = Some(AuthenticatorTime {
        ctime: authenticator.0.ctime.0.clone(),
        cusec: integer_to_u32(&authenticator.0.cusec.0 .0)?,
    });

    let ap_req = generate_ap_req(GenerateApReqOptions {
        ticket,
        session_key: &ap_session_key,
        encryption_type: &encryption_type,
        authenticator: &authenticator,
        options: ap_options,
        key_usage: AP_REQ_AUTHENTICATOR,
        crypto: client.crypto.as_ref(),
    })?;
    let encoded_ap_req = picky_asn1_der::to_vec(&ap_req)?;

    let token = if checksum_flags.is_dce_style() {
        encoded_ap_req
    } else {
        gss_token::wrap(&encoded_ap_req, TokenId::ApReq, client.config.token_profile)?
    };

    client.context.sub_key = Some(sub_key.key_value);
    client.token = Some(token.clone());
    client.state = KerberosState::TokenProduced;

    let continue_needed = client
        .context_requirements
        .intersects(ClientRequestFlags::MUTUAL_AUTH | ClientRequestFlags::USE_DCE_STYLE);

    if continue_needed {
        client.state = KerberosState::ContinuePending;

        Ok(InitializeSecurityContextResult {
            status: SecurityStatus::ContinueNeeded,
            output_token: Some(token),
        })
    } else {
        client.context.session_key = client.context.sub_key.clone();
        client.context.authenticator_time = None;
        client.state = KerberosState::Established;

        Ok(InitializeSecurityContextResult {
            status: SecurityStatus::Ok,
            output_token: Some(token),
        })
    }
}

/// Extracts the AP-REP PDU from the acceptor token.
fn extract_ap_rep(client: &KerberosClient, input_token: &[u8]) -> Result<Vec<u8>> {
    let token = if client.config.token_profile == TokenProfile::Negotiate
        && input_token.first() == Some(&NEG_TOKEN_RESP_TAG)
    {
        gss_token::strip_negotiation_envelope(input_token)?
    } else {
        input_token.to_vec()
    };

    if client.context.checksum_flags.is_dce_style() && !gss_token::has_gss_header(&token) {
        // DCE style peers answer with the bare AP-REP
        return Ok(token);
    }

    gss_token::unwrap(&token, TokenId::ApRep, TokenProfile::Kerberos)
}

/// Validates the AP-REP of the acceptor ([RFC 4120 3.2.5](https://www.rfc-editor.org/rfc/rfc4120#section-3.2.5)).
#[instrument(level = "debug", skip_all)]
fn continue_exchange(client: &mut KerberosClient, input_token: &[u8]) -> Result<InitializeSecurityContextResult> {
    let ap_rep_pdu = extract_ap_rep(client, input_token)?;

    match PduKind::from_pdu(&ap_rep_pdu) {
        Some(PduKind::ApRep) => {}
        Some(PduKind::KrbError) => {
            let krb_error: KrbError = picky_asn1_der::from_bytes(&ap_rep_pdu)?;

            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                format!(
                    "the server rejected the AP_REQ with error code {}",
                    krb_error_code(&krb_error)
                ),
            ));
        }
        kind => {
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                format!("expected AP_REP but got {:?}", kind),
            ))
        }
    }
    let ap_rep: ApRep = picky_asn1_der::from_bytes(&ap_rep_pdu)?;

    let ap_session_key = client
        .context
        .ap_session_key
        .clone()
        .ok_or_else(|| missing("AP session key"))?;
    let encryption_type = client
        .context
        .encryption_type
        .clone()
        .ok_or_else(|| missing("encryption type"))?;
    let authenticator_time = client
        .context
        .authenticator_time
        .clone()
        .ok_or_else(|| missing("authenticator"))?;

    let enc_ap_rep_part = decrypt_ap_rep(client.crypto.as_ref(), &ap_rep, ap_session_key.as_ref(), &encryption_type)?;
    let validated = validate_ap_rep(enc_ap_rep_part, &authenticator_time)?;

    debug!(seq_number = validated.seq_number, "AP_REP is valid");

    client.context.remote_seq_number = Some(u64::from(validated.seq_number));

    match validated.subkey {
        Some(subkey) => {
            client.context.encryption_type = Some(cipher_suite_from_id(&subkey.key_type.0 .0)?);
            client.context.session_key = Some(Secret::from(subkey.key_value.0 .0));
            client.context.acceptor_subkey = true;
        }
        None => {
            client.context.session_key = client.context.sub_key.clone();
        }
    }

    let output_token = if client.context.checksum_flags.is_dce_style() {
        let local_seq_number = u32::try_from(client.context.local_seq_number)
            .map_err(|_| Error::new(ErrorKind::InternalError, "local sequence number does not fit into 32 bits"))?;

        let ap_rep = generate_ap_rep(GenerateApRepOptions {
            session_key: &ap_session_key,
            encryption_type: &encryption_type,
            ctime: authenticator_time.ctime,
            cusec: authenticator_time.cusec,
            seq_number: local_seq_number,
            crypto: client.crypto.as_ref(),
        })?;

        Some(picky_asn1_der::to_vec(&ap_rep)?)
    } else {
        None
    };

    client.context.authenticator_time = None;
    client.token = output_token.clone();
    client.state = KerberosState::Established;

    Ok(InitializeSecurityContextResult {
        status: SecurityStatus::Ok,
        output_token,
    })
}
