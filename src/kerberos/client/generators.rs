use picky_asn1::bit_string::BitString;
use picky_asn1::date::GeneralizedTime;
use picky_asn1::restricted_string::IA5String;
use picky_asn1::wrapper::{
    Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, ExplicitContextTag3,
    ExplicitContextTag4, ExplicitContextTag5, ExplicitContextTag6, ExplicitContextTag7, ExplicitContextTag8,
    ExplicitContextTag9, GeneralizedTimeAsn1, IntegerAsn1, OctetStringAsn1, Optional,
};
use picky_krb::constants::gss_api::AUTHENTICATOR_CHECKSUM_TYPE;
use picky_krb::constants::key_usages::AP_REP_ENC;
use picky_krb::constants::types::{
    AP_REP_MSG_TYPE, AP_REQ_MSG_TYPE, AS_REQ_MSG_TYPE, NET_BIOS_ADDR_TYPE, NT_PRINCIPAL, NT_SRV_INST, PA_ENC_TIMESTAMP,
    PA_ENC_TIMESTAMP_KEY_USAGE, PA_PAC_OPTIONS_TYPE, PA_PAC_REQUEST_TYPE, PA_TGS_REQ_TYPE, TGS_REQ_MSG_TYPE,
};
use picky_krb::crypto::{ChecksumSuite, CipherSuite};
use picky_krb::data_types::{
    ApOptions, Authenticator, AuthenticatorInner, Checksum, EncApRepPart, EncApRepPartInner, EncryptedData,
    EncryptionKey, HostAddress, KerbPaPacRequest, KerberosFlags, KerberosStringAsn1, KerberosTime, Microseconds,
    PaData, PaEncTsEnc, PaPacOptions, PrincipalName, Realm, Ticket,
};
use picky_krb::messages::{ApRep, ApRepInner, ApReq, ApReqInner, AsReq, KdcReq, KdcReqBody, TgsReq};
use time::{Duration, OffsetDateTime};

use crate::crypto::{etype_id, KerberosCrypto};
use crate::kerberos::flags::{ApOptions as ApOptionsFlags, GssFlags, KdcOptions};
use crate::kerberos::{KERBEROS_VERSION, TGT_SERVICE_NAME};
use crate::{Error, ErrorKind, Result, Secret};

const TGT_TICKET_LIFETIME_DAYS: i64 = 3;

/// Minimal DER INTEGER of a microseconds value.
fn encode_microseconds(microseconds: u32) -> Microseconds {
    IntegerAsn1::from_bytes_be_unsigned(microseconds.to_be_bytes().to_vec())
}

/// [Microseconds](https://www.rfc-editor.org/rfc/rfc4120#section-5.2.4).
/// The maximum microseconds value.
///
/// ```not_rust
/// Microseconds    ::= INTEGER (0..999999)
/// ```
pub const MAX_MICROSECONDS: u32 = 999_999;

/// Key usage of the checksum over the KDC-REQ-BODY in the PA-TGS-REQ authenticator
/// ([RFC 4120 7.5.1](https://www.rfc-editor.org/rfc/rfc4120#section-7.5.1)).
pub const TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR_CKSUM: i32 = 6;

/// Claims and Forward to full DC.
///
/// [MS-KILE 2.2.10 PA-PAC-OPTIONS](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-kile/99721ffd-0d49-4b45-ac59-df9ae4b1b8b8)
pub const DEFAULT_PA_PAC_OPTIONS: [u8; 4] = [0xa0, 0x00, 0x00, 0x00];

/// [Authenticator Checksum](https://datatracker.ietf.org/doc/html/rfc4121#section-4.1.1) without channel bindings.
///
/// `Lgth` (4 bytes, little-endian) = 16 followed by 16 zero bytes of the `Bnd` field.
/// The checksum flags follow.
const GSS_CHECKSUM_PREFIX: [u8; 20] = [
    0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

pub fn kdc_options() -> KdcOptions {
    KdcOptions::FORWARDABLE | KdcOptions::CANONICALIZE | KdcOptions::RENEWABLE
}

/// Splits `service/host[@REALM]` into its service and host parts.
pub fn parse_target_name(target_name: &str) -> Result<(&str, &str)> {
    let target_name = target_name.split('@').next().unwrap_or(target_name);

    match target_name.split_once('/') {
        Some((service, host)) if !service.is_empty() && !host.is_empty() => Ok((service, host)),
        _ => Err(Error::new(
            ErrorKind::InvalidParameter,
            format!("invalid service principal name: {}", target_name),
        )),
    }
}

pub fn principal_name(name_type: u8, names: &[&str]) -> Result<PrincipalName> {
    let mut name_string = Vec::with_capacity(names.len());
    for name in names {
        name_string.push(KerberosStringAsn1::from(IA5String::from_string((*name).to_owned())?));
    }

    Ok(PrincipalName {
        name_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![name_type])),
        name_string: ExplicitContextTag1::from(Asn1SequenceOf::from(name_string)),
    })
}

pub fn client_principal_name(account_name: &str) -> Result<PrincipalName> {
    principal_name(NT_PRINCIPAL, &[account_name])
}

fn current_time() -> (OffsetDateTime, u32) {
    let current_date = OffsetDateTime::now_utc();
    let microseconds = current_date.microsecond().min(MAX_MICROSECONDS);

    (current_date, microseconds)
}

fn encrypted_data(encryption_type: &CipherSuite, cipher: Vec<u8>) -> EncryptedData {
    EncryptedData {
        etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![etype_id(encryption_type)])),
        kvno: Optional::from(None),
        cipher: ExplicitContextTag2::from(OctetStringAsn1::from(cipher)),
    }
}

fn pa_pac_datas() -> Result<Vec<PaData>> {
    Ok(vec![
        PaData {
            padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_PAC_REQUEST_TYPE.to_vec())),
            padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&KerbPaPacRequest {
                include_pac: ExplicitContextTag0::from(true),
            })?)),
        },
        PaData {
            padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_PAC_OPTIONS_TYPE.to_vec())),
            padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&PaPacOptions {
                flags: ExplicitContextTag0::from(KerberosFlags::from(BitString::with_bytes(
                    DEFAULT_PA_PAC_OPTIONS.to_vec(),
                ))),
            })?)),
        },
    ])
}

/// Parameters for generating pa-datas for [AsReq] message.
#[derive(Debug)]
pub struct GenerateAsPaDataOptions<'a> {
    /// Key derived from the password for the encryption type.
    pub key: &'a Secret<Vec<u8>>,
    pub encryption_type: &'a CipherSuite,
    pub crypto: &'a dyn KerberosCrypto,
}

/// Generates PA-ENC-TIMESTAMP, PA-PAC-REQUEST and PA-PAC-OPTIONS.
#[instrument(level = "trace", ret, skip_all)]
pub fn generate_pa_datas_for_as_req(options: &GenerateAsPaDataOptions<'_>) -> Result<Vec<PaData>> {
    let GenerateAsPaDataOptions {
        key,
        encryption_type,
        crypto,
    } = options;

    let (current_date, microseconds) = current_time();

    let timestamp = PaEncTsEnc {
        patimestamp: ExplicitContextTag0::from(KerberosTime::from(GeneralizedTime::from(current_date))),
        pausec: Optional::from(Some(ExplicitContextTag1::from(encode_microseconds(microseconds)))),
    };
    let timestamp_bytes = picky_asn1_der::to_vec(&timestamp)?;

    let encrypted_timestamp = crypto.encrypt(
        encryption_type,
        key.as_ref(),
        &timestamp_bytes,
        PA_ENC_TIMESTAMP_KEY_USAGE,
    )?;

    trace!(?current_date, ?microseconds, "Encrypted timestamp params");

    let mut pa_datas = vec![PaData {
        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_ENC_TIMESTAMP.to_vec())),
        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&encrypted_data(
            encryption_type,
            encrypted_timestamp,
        ))?)),
    }];
    pa_datas.extend(pa_pac_datas()?);

    Ok(pa_datas)
}

/// Parameters for generating [AsReq].
#[derive(Debug)]
pub struct GenerateAsReqOptions<'a> {
    pub realm: &'a str,
    pub cname: &'a PrincipalName,
    pub nonce: u32,
    pub hostname: Option<&'a str>,
    pub encryption_types: &'a [CipherSuite],
}

fn etype_list(encryption_types: &[CipherSuite]) -> Asn1SequenceOf<IntegerAsn1> {
    Asn1SequenceOf::from(
        encryption_types
            .iter()
            .map(|etype| IntegerAsn1::from(vec![etype_id(etype)]))
            .collect::<Vec<_>>(),
    )
}

fn ticket_expiration_date() -> Result<OffsetDateTime> {
    OffsetDateTime::now_utc()
        .checked_add(Duration::days(TGT_TICKET_LIFETIME_DAYS))
        .ok_or_else(|| Error::new(ErrorKind::InternalError, "ticket expiration date overflow"))
}

#[instrument(level = "trace", ret)]
pub fn generate_as_req_kdc_body(options: &GenerateAsReqOptions<'_>) -> Result<KdcReqBody> {
    let GenerateAsReqOptions {
        realm,
        cname,
        nonce,
        hostname,
        encryption_types,
    } = options;

    let expiration_date = ticket_expiration_date()?;

    let addresses = hostname.map(|hostname| {
        ExplicitContextTag9::from(Asn1SequenceOf::from(vec![HostAddress {
            addr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![NET_BIOS_ADDR_TYPE])),
            address: ExplicitContextTag1::from(OctetStringAsn1::from(hostname.as_bytes().to_vec())),
        }]))
    });

    Ok(KdcReqBody {
        kdc_options: ExplicitContextTag0::from(KerberosFlags::from(BitString::with_bytes(
            kdc_options().bits().to_be_bytes().to_vec(),
        ))),
        cname: Optional::from(Some(ExplicitContextTag1::from((*cname).clone()))),
        realm: ExplicitContextTag2::from(Realm::from(IA5String::from_string((*realm).to_owned())?)),
        sname: Optional::from(Some(ExplicitContextTag3::from(principal_name(
            NT_SRV_INST,
            &[TGT_SERVICE_NAME, *realm],
        )?))),
        from: Optional::from(None),
        till: ExplicitContextTag5::from(GeneralizedTimeAsn1::from(GeneralizedTime::from(expiration_date))),
        rtime: Optional::from(Some(ExplicitContextTag6::from(GeneralizedTimeAsn1::from(
            GeneralizedTime::from(expiration_date),
        )))),
        nonce: ExplicitContextTag7::from(IntegerAsn1::from_bytes_be_unsigned(nonce.to_be_bytes().to_vec())),
        etype: ExplicitContextTag8::from(etype_list(encryption_types)),
        addresses: Optional::from(addresses),
        enc_authorization_data: Optional::from(None),
        additional_tickets: Optional::from(None),
    })
}

/// Generates [AsReq]. The first request of the exchange is sent without pa-datas.
#[instrument(level = "debug", ret, skip_all)]
pub fn generate_as_req(pa_datas: Option<Vec<PaData>>, kdc_req_body: KdcReqBody) -> AsReq {
    AsReq::from(KdcReq {
        pvno: ExplicitContextTag1::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag2::from(IntegerAsn1::from(vec![AS_REQ_MSG_TYPE])),
        padata: Optional::from(pa_datas.map(|pa_datas| ExplicitContextTag3::from(Asn1SequenceOf::from(pa_datas)))),
        req_body: ExplicitContextTag4::from(kdc_req_body),
    })
}

/// Parameters for generating the [KdcReqBody] of a [TgsReq].
#[derive(Debug)]
pub struct GenerateTgsReqOptions<'a> {
    pub realm: &'a str,
    pub service_principal: &'a str,
    pub nonce: u32,
    pub encryption_types: &'a [CipherSuite],
}

#[instrument(level = "trace", ret)]
pub fn generate_tgs_req_kdc_body(options: &GenerateTgsReqOptions<'_>) -> Result<KdcReqBody> {
    let GenerateTgsReqOptions {
        realm,
        service_principal,
        nonce,
        encryption_types,
    } = options;

    let (service_name, host_name) = parse_target_name(service_principal)?;
    let expiration_date = ticket_expiration_date()?;

    Ok(KdcReqBody {
        kdc_options: ExplicitContextTag0::from(KerberosFlags::from(BitString::with_bytes(
            kdc_options().bits().to_be_bytes().to_vec(),
        ))),
        cname: Optional::from(None),
        realm: ExplicitContextTag2::from(Realm::from(IA5String::from_string((*realm).to_owned())?)),
        sname: Optional::from(Some(ExplicitContextTag3::from(principal_name(
            NT_SRV_INST,
            &[service_name, host_name],
        )?))),
        from: Optional::from(None),
        till: ExplicitContextTag5::from(GeneralizedTimeAsn1::from(GeneralizedTime::from(expiration_date))),
        rtime: Optional::from(Some(ExplicitContextTag6::from(GeneralizedTimeAsn1::from(
            GeneralizedTime::from(expiration_date),
        )))),
        nonce: ExplicitContextTag7::from(IntegerAsn1::from_bytes_be_unsigned(nonce.to_be_bytes().to_vec())),
        etype: ExplicitContextTag8::from(etype_list(encryption_types)),
        addresses: Optional::from(None),
        enc_authorization_data: Optional::from(None),
        additional_tickets: Optional::from(None),
    })
}

/// Generates [TgsReq] with PA-PAC-REQUEST, PA-PAC-OPTIONS and PA-TGS-REQ pa-datas, in this order.
#[instrument(level = "debug", ret, skip_all)]
pub fn generate_tgs_req(kdc_req_body: KdcReqBody, pa_tgs_req: &ApReq) -> Result<TgsReq> {
    let mut pa_datas = pa_pac_datas()?;
    pa_datas.push(PaData {
        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_TGS_REQ_TYPE.to_vec())),
        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(pa_tgs_req)?)),
    });

    Ok(TgsReq::from(KdcReq {
        pvno: ExplicitContextTag1::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag2::from(IntegerAsn1::from(vec![TGS_REQ_MSG_TYPE])),
        padata: Optional::from(Some(ExplicitContextTag3::from(Asn1SequenceOf::from(pa_datas)))),
        req_body: ExplicitContextTag4::from(kdc_req_body),
    }))
}

/// Checksum carried by an [Authenticator].
#[derive(Debug)]
pub enum AuthenticatorChecksum<'a> {
    /// Keyed checksum over `bound_data`, computed with the session key.
    Standard {
        checksum_type: ChecksumSuite,
        bound_data: &'a [u8],
    },
    /// [RFC 4121 4.1.1](https://datatracker.ietf.org/doc/html/rfc4121#section-4.1.1) GSS checksum (type 0x8003).
    Gss8003(GssFlags),
    None,
}

/// Builds the value of the 0x8003 checksum: `Lgth`, `Bnd` and the flags in little-endian.
pub fn gss_checksum_value(flags: GssFlags) -> Vec<u8> {
    let mut checksum = GSS_CHECKSUM_PREFIX.to_vec();
    checksum.extend_from_slice(&flags.bits().to_le_bytes());

    checksum
}

/// Encryption key.
#[derive(Debug)]
pub struct EncKey {
    /// Encryption type.
    pub key_type: CipherSuite,
    /// Encryption key value.
    pub key_value: Secret<Vec<u8>>,
}

/// Input parameters for generating an [Authenticator].
#[derive(Debug)]
pub struct GenerateAuthenticatorOptions<'a> {
    pub crealm: &'a str,
    pub cname: &'a PrincipalName,
    /// Sequence number.
    pub seq_num: Option<u32>,
    /// Sub-session encryption key.
    pub sub_key: Option<&'a EncKey>,
    pub checksum: AuthenticatorChecksum<'a>,
    /// Session key of the ticket the authenticator is sent with. Keys the standard checksum.
    pub session_key: &'a Secret<Vec<u8>>,
    pub crypto: &'a dyn KerberosCrypto,
}

#[instrument(level = "trace", ret, skip_all)]
pub fn generate_authenticator(options: GenerateAuthenticatorOptions<'_>) -> Result<Authenticator> {
    let GenerateAuthenticatorOptions {
        crealm,
        cname,
        seq_num,
        sub_key,
        checksum,
        session_key,
        crypto,
    } = options;

    let (current_date, microseconds) = current_time();

    let cksum = match checksum {
        AuthenticatorChecksum::Standard {
            checksum_type,
            bound_data,
        } => {
            let checksum_value = crypto.checksum(
                session_key.as_ref(),
                bound_data,
                TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR_CKSUM,
                &checksum_type,
            )?;

            Some(Checksum {
                cksumtype: ExplicitContextTag0::from(IntegerAsn1::from(vec![checksum_type.into()])),
                checksum: ExplicitContextTag1::from(OctetStringAsn1::from(checksum_value)),
            })
        }
        AuthenticatorChecksum::Gss8003(flags) => Some(Checksum {
            cksumtype: ExplicitContextTag0::from(IntegerAsn1::from(AUTHENTICATOR_CHECKSUM_TYPE.to_vec())),
            checksum: ExplicitContextTag1::from(OctetStringAsn1::from(gss_checksum_value(flags))),
        }),
        AuthenticatorChecksum::None => None,
    };

    Ok(Authenticator::from(AuthenticatorInner {
        authenticator_vno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        crealm: ExplicitContextTag1::from(Realm::from(IA5String::from_string(crealm.to_owned())?)),
        cname: ExplicitContextTag2::from(cname.clone()),
        cksum: Optional::from(cksum.map(ExplicitContextTag3::from)),
        cusec: ExplicitContextTag4::from(encode_microseconds(microseconds)),
        ctime: ExplicitContextTag5::from(KerberosTime::from(GeneralizedTime::from(current_date))),
        subkey: Optional::from(sub_key.map(|EncKey { key_type, key_value }| {
            ExplicitContextTag6::from(EncryptionKey {
                key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![etype_id(key_type)])),
                key_value: ExplicitContextTag1::from(OctetStringAsn1::from(key_value.as_ref().clone())),
            })
        })),
        seq_number: Optional::from(seq_num.map(|seq_num| {
            ExplicitContextTag7::from(IntegerAsn1::from_bytes_be_unsigned(seq_num.to_be_bytes().to_vec()))
        })),
        authorization_data: Optional::from(None),
    }))
}

/// Parameters for generating [ApReq].
#[derive(Debug)]
pub struct GenerateApReqOptions<'a> {
    pub ticket: Ticket,
    pub session_key: &'a Secret<Vec<u8>>,
    pub encryption_type: &'a CipherSuite,
    pub authenticator: &'a Authenticator,
    pub options: ApOptionsFlags,
    /// `TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR` inside a TGS-REQ, `AP_REQ_AUTHENTICATOR` otherwise.
    pub key_usage: i32,
    pub crypto: &'a dyn KerberosCrypto,
}

#[instrument(level = "trace", ret, skip_all)]
pub fn generate_ap_req(options: GenerateApReqOptions<'_>) -> Result<ApReq> {
    let GenerateApReqOptions {
        ticket,
        session_key,
        encryption_type,
        authenticator,
        options,
        key_usage,
        crypto,
    } = options;

    let encoded_authenticator = picky_asn1_der::to_vec(authenticator)?;
    let encrypted_authenticator = crypto.encrypt(
        encryption_type,
        session_key.as_ref(),
        &encoded_authenticator,
        key_usage,
    )?;

    trace!(?encryption_type, key_usage, "AP_REQ authenticator encryption params");

    Ok(ApReq::from(ApReqInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AP_REQ_MSG_TYPE])),
        ap_options: ExplicitContextTag2::from(ApOptions::from(BitString::with_bytes(
            options.bits().to_be_bytes().to_vec(),
        ))),
        ticket: ExplicitContextTag3::from(ticket),
        authenticator: ExplicitContextTag4::from(encrypted_data(encryption_type, encrypted_authenticator)),
    }))
}

/// Parameters for generating the third-leg [ApRep] of the DCE style authentication.
#[derive(Debug)]
pub struct GenerateApRepOptions<'a> {
    pub session_key: &'a Secret<Vec<u8>>,
    pub encryption_type: &'a CipherSuite,
    pub ctime: KerberosTime,
    pub cusec: u32,
    pub seq_number: u32,
    pub crypto: &'a dyn KerberosCrypto,
}

#[instrument(level = "trace", skip_all, ret)]
pub fn generate_ap_rep(options: GenerateApRepOptions<'_>) -> Result<ApRep> {
    let GenerateApRepOptions {
        session_key,
        encryption_type,
        ctime,
        cusec,
        seq_number,
        crypto,
    } = options;

    let enc_ap_rep_part = EncApRepPart::from(EncApRepPartInner {
        ctime: ExplicitContextTag0::from(ctime),
        cusec: ExplicitContextTag1::from(encode_microseconds(cusec)),
        subkey: Optional::from(None),
        seq_number: Optional::from(Some(ExplicitContextTag3::from(IntegerAsn1::from_bytes_be_unsigned(
            seq_number.to_be_bytes().to_vec(),
        )))),
    });

    let encoded_enc_ap_rep_part = picky_asn1_der::to_vec(&enc_ap_rep_part)?;
    let encrypted_enc_ap_rep_part = crypto.encrypt(
        encryption_type,
        session_key.as_ref(),
        &encoded_enc_ap_rep_part,
        AP_REP_ENC,
    )?;

    Ok(ApRep::from(ApRepInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AP_REP_MSG_TYPE])),
        enc_part: ExplicitContextTag2::from(encrypted_data(encryption_type, encrypted_enc_ap_rep_part)),
    }))
}
