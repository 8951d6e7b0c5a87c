//! GSS-API framing of the Kerberos tokens.
//!
//! [RFC 2743 3.1](https://www.rfc-editor.org/rfc/rfc2743#section-3.1) mechanism header:
//! `0x60 || DER length || mechanism OID || token id (2 bytes, big-endian) || inner PDU`.
//! The negotiation profile additionally wraps the token into a SPNEGO
//! [RFC 4178](https://www.rfc-editor.org/rfc/rfc4178) envelope.

use picky_asn1::tag::Tag;
use picky_asn1::wrapper::{ExplicitContextTag0, ExplicitContextTag2, ObjectIdentifierAsn1, OctetStringAsn1, Optional};
use picky_asn1_der::Asn1RawDer;
use picky_asn1_x509::oids;
use picky_krb::constants::gss_api::ACCEPT_INCOMPLETE;
use picky_krb::gss_api::{
    ApplicationTag0, GssApiNegInit, KrbMessage, MechType, MechTypeList, NegTokenInit, NegTokenTarg, NegTokenTarg1,
};

use crate::{Error, ErrorKind, Result};

/// Tag of the GSS-API InitialContextToken.
pub const GSS_HEADER_TAG: u8 = 0x60;

/// Framing applied to the tokens exchanged with the peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum TokenProfile {
    /// Kerberos mechanism header only.
    #[default]
    Kerberos,
    /// Kerberos mechanism token inside a SPNEGO envelope.
    Negotiate,
}

/// Kerberos GSS-API token identifiers ([RFC 4121 4.1](https://www.rfc-editor.org/rfc/rfc4121#section-4.1)).
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TokenId {
    ApReq = 0x0100,
    ApRep = 0x0200,
    KrbError = 0x0300,
}

impl TokenId {
    pub fn to_be_bytes(self) -> [u8; 2] {
        (self as u16).to_be_bytes()
    }
}

pub fn get_mech_list() -> MechTypeList {
    MechTypeList::from(vec![MechType::from(oids::ms_krb5()), MechType::from(oids::krb5())])
}

/// Prefixes the inner PDU with the Kerberos mechanism header and the token id.
fn wrap_mech_token(inner: &[u8], token_id: TokenId) -> Result<Vec<u8>> {
    let krb_blob = ApplicationTag0(KrbMessage {
        krb5_oid: ObjectIdentifierAsn1::from(oids::krb5()),
        krb5_token_id: token_id.to_be_bytes(),
        krb_msg: Asn1RawDer(inner.to_vec()),
    });

    Ok(picky_asn1_der::to_vec(&krb_blob)?)
}

/// Strips and validates the Kerberos mechanism header and the token id.
fn unwrap_mech_token(token: &[u8], expected_token_id: TokenId) -> Result<Vec<u8>> {
    if !has_gss_header(token) {
        return Err(Error::new(
            ErrorKind::FormatError,
            format!("GSS token must start with 0x{:02x}", GSS_HEADER_TAG),
        ));
    }

    let krb_message = KrbMessage::<Asn1RawDer>::decode_application_krb_message(token)?.0;

    let mech = &krb_message.krb5_oid.0;
    if *mech != oids::krb5() && *mech != oids::ms_krb5() {
        return Err(Error::new(
            ErrorKind::ProtocolViolation,
            format!("unexpected GSS mechanism: {:?}", mech),
        ));
    }

    if krb_message.krb5_token_id != expected_token_id.to_be_bytes() {
        return Err(Error::new(
            ErrorKind::ProtocolViolation,
            format!(
                "unexpected GSS token id: {:02x?}, expected {:?}",
                krb_message.krb5_token_id, expected_token_id
            ),
        ));
    }

    Ok(krb_message.krb_msg.0)
}

/// Decodes `ApplicationTag0<GssApiNegInit>` reporting malformed content as an error.
fn decode_neg_token_init(token: &[u8]) -> Result<GssApiNegInit> {
    if !has_gss_header(token) {
        return Err(Error::new(ErrorKind::FormatError, "token is neither NegTokenResp nor NegTokenInit"));
    }

    // the application tag stands in place of the SEQUENCE tag
    let mut raw = token.to_vec();
    raw[0] = Tag::SEQUENCE.inner();

    Ok(picky_asn1_der::from_bytes(&raw)?)
}

/// Wraps the inner Kerberos PDU into a GSS token of the given profile.
///
/// With the negotiation profile an AP-REQ is sent inside a `NegTokenInit`, every other token
/// inside a `NegTokenResp`.
pub fn wrap(inner: &[u8], token_id: TokenId, profile: TokenProfile) -> Result<Vec<u8>> {
    let mech_token = wrap_mech_token(inner, token_id)?;

    match profile {
        TokenProfile::Kerberos => Ok(mech_token),
        TokenProfile::Negotiate if token_id == TokenId::ApReq => {
            let neg_token_init = ApplicationTag0(GssApiNegInit {
                oid: ObjectIdentifierAsn1::from(oids::spnego()),
                neg_token_init: ExplicitContextTag0::from(NegTokenInit {
                    mech_types: Optional::from(Some(ExplicitContextTag0::from(get_mech_list()))),
                    req_flags: Optional::from(None),
                    mech_token: Optional::from(Some(ExplicitContextTag2::from(OctetStringAsn1::from(mech_token)))),
                    mech_list_mic: Optional::from(None),
                }),
            });

            Ok(picky_asn1_der::to_vec(&neg_token_init)?)
        }
        TokenProfile::Negotiate => {
            let neg_token_targ = NegTokenTarg1::from(NegTokenTarg {
                neg_result: Optional::from(Some(ExplicitContextTag0::from(Asn1RawDer(ACCEPT_INCOMPLETE.to_vec())))),
                supported_mech: Optional::from(None),
                response_token: Optional::from(Some(ExplicitContextTag2::from(OctetStringAsn1::from(mech_token)))),
                mech_list_mic: Optional::from(None),
            });

            Ok(picky_asn1_der::to_vec(&neg_token_targ)?)
        }
    }
}

/// Extracts the Kerberos mechanism token from a SPNEGO `NegTokenResp` or `NegTokenInit`.
pub fn strip_negotiation_envelope(token: &[u8]) -> Result<Vec<u8>> {
    if let Ok(neg_token_targ) = picky_asn1_der::from_bytes::<NegTokenTarg1>(token) {
        let NegTokenTarg { response_token, .. } = neg_token_targ.0;

        return response_token
            .0
            .map(|token| token.0 .0)
            .ok_or_else(|| Error::new(ErrorKind::FormatError, "NegTokenResp has no response token"));
    }

    let neg_token_init = decode_neg_token_init(token)?;

    neg_token_init
        .neg_token_init
        .0
        .mech_token
        .0
        .map(|token| token.0 .0)
        .ok_or_else(|| Error::new(ErrorKind::FormatError, "NegTokenInit has no mechanism token"))
}

/// Unwraps a GSS token of the given profile and returns the inner Kerberos PDU.
pub fn unwrap(token: &[u8], expected_token_id: TokenId, profile: TokenProfile) -> Result<Vec<u8>> {
    match profile {
        TokenProfile::Kerberos => unwrap_mech_token(token, expected_token_id),
        TokenProfile::Negotiate => unwrap_mech_token(&strip_negotiation_envelope(token)?, expected_token_id),
    }
}

/// Checks whether the token starts with the GSS-API InitialContextToken tag.
pub fn has_gss_header(token: &[u8]) -> bool {
    token.first() == Some(&GSS_HEADER_TAG)
}
