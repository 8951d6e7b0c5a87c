use kerberos_sspi_client::crypto::cipher_suite_from_id;
use kerberos_sspi_client::kerberos::client::extractors::integer_to_u32;
use kerberos_sspi_client::kerberos::gss_token::{self, TokenId, TokenProfile};
use kerberos_sspi_client::kerberos::message_protection::{self, ProtectionKey, WrappedMessage};
use kerberos_sspi_client::{PickyCrypto, Result};
use picky_asn1::date::GeneralizedTime;
use picky_asn1::wrapper::{
    ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, ExplicitContextTag3, IntegerAsn1,
    OctetStringAsn1, Optional,
};
use picky_krb::constants::key_usages::{AP_REP_ENC, AP_REQ_AUTHENTICATOR, TICKET_REP};
use picky_krb::constants::types::AP_REP_MSG_TYPE;
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{
    Authenticator, EncApRepPart, EncApRepPartInner, EncTicketPart, EncryptedData, EncryptionKey, KerberosTime,
    Microseconds,
};
use picky_krb::messages::{ApRep, ApRepInner, ApReq};
use rand::rngs::OsRng;
use rand::Rng;
use time::{Duration, OffsetDateTime};

use super::kdc::KDC_ENCRYPTION_TYPE;

/// Checksum type of the GSS-API authenticator checksum.
const GSS_CHECKSUM_TYPE: u32 = 0x8003;

/// Deliberate corruption of the AP-REP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApRepTamper {
    #[default]
    None,
    /// The AP-REP carries a ctime other than the authenticator one.
    Ctime,
    /// The AP-REP carries a cusec other than the authenticator one.
    Cusec,
    ZeroSeqNumber,
}

/// Context established on the acceptor side.
#[derive(Debug)]
pub struct AcceptorSession {
    /// Session key of the service ticket.
    pub ticket_session_key: Vec<u8>,
    pub encryption_type: CipherSuite,
    /// Key protecting the messages.
    pub key: Vec<u8>,
    pub acceptor_subkey: bool,
    /// Value of the GSS-API authenticator checksum.
    pub checksum: Vec<u8>,
    pub initiator_seq_number: u32,
    /// Next sequence number of the acceptor.
    pub seq_number: u64,
}

/// Server side of the AP exchange holding the service long-term key.
#[derive(Debug)]
pub struct MockAcceptor {
    service_key: Vec<u8>,
    profile: TokenProfile,
    dce_style: bool,
    acceptor_subkey: Option<Vec<u8>>,
    tamper: ApRepTamper,
    crypto: PickyCrypto,
    session: Option<AcceptorSession>,
}

impl MockAcceptor {
    pub fn new(service_key: Vec<u8>) -> Self {
        Self {
            service_key,
            profile: TokenProfile::Kerberos,
            dce_style: false,
            acceptor_subkey: None,
            tamper: ApRepTamper::None,
            crypto: PickyCrypto,
            session: None,
        }
    }

    pub fn with_profile(mut self, profile: TokenProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_dce_style(mut self) -> Self {
        self.dce_style = true;
        self
    }

    pub fn with_acceptor_subkey(mut self, subkey: Vec<u8>) -> Self {
        self.acceptor_subkey = Some(subkey);
        self
    }

    pub fn with_tamper(mut self, tamper: ApRepTamper) -> Self {
        self.tamper = tamper;
        self
    }

    pub fn session(&self) -> &AcceptorSession {
        self.session.as_ref().expect("AP-REQ is not accepted yet")
    }

    fn key(&self) -> ProtectionKey<'_> {
        let session = self.session();

        ProtectionKey {
            crypto: &self.crypto,
            encryption_type: &session.encryption_type,
            key: &session.key,
            acceptor_subkey: session.acceptor_subkey,
        }
    }

    /// Validates the AP-REQ token and returns the AP-REP token.
    pub fn accept(&mut self, token: &[u8]) -> Vec<u8> {
        let ap_req = if self.dce_style {
            token.to_vec()
        } else {
            gss_token::unwrap(token, TokenId::ApReq, self.profile).unwrap()
        };
        let ap_req: ApReq = picky_asn1_der::from_bytes(&ap_req).unwrap();

        let ticket_enc_part = KDC_ENCRYPTION_TYPE
            .cipher()
            .decrypt(&self.service_key, TICKET_REP, &ap_req.0.ticket.0 .0.enc_part.0.cipher.0 .0)
            .unwrap();
        let ticket_enc_part: EncTicketPart = picky_asn1_der::from_bytes(&ticket_enc_part).unwrap();
        let ticket_session_key = ticket_enc_part.0.key.0.key_value.0 .0;
        let ticket_encryption_type = cipher_suite_from_id(&ticket_enc_part.0.key.0.key_type.0 .0).unwrap();

        let authenticator = ticket_encryption_type
            .cipher()
            .decrypt(
                &ticket_session_key,
                AP_REQ_AUTHENTICATOR,
                &ap_req.0.authenticator.0.cipher.0 .0,
            )
            .unwrap();
        let authenticator: Authenticator = picky_asn1_der::from_bytes(&authenticator).unwrap();
        let authenticator = authenticator.0;

        let checksum = authenticator.cksum.0.expect("authenticator has no checksum").0;
        assert_eq!(integer_to_u32(&checksum.cksumtype.0 .0).unwrap(), GSS_CHECKSUM_TYPE);

        let initiator_subkey = authenticator.subkey.0.expect("authenticator has no sub-key").0;
        let initiator_seq_number =
            integer_to_u32(&authenticator.seq_number.0.expect("authenticator has no sequence number").0 .0).unwrap();

        let seq_number = OsRng.gen_range(1..0x7fff_ffff_u32);

        let ctime = match self.tamper {
            ApRepTamper::Ctime => KerberosTime::from(GeneralizedTime::from(
                OffsetDateTime::now_utc() - Duration::minutes(5),
            )),
            _ => authenticator.ctime.0,
        };
        let cusec = match self.tamper {
            ApRepTamper::Cusec => {
                let cusec = integer_to_u32(&authenticator.cusec.0 .0).unwrap();

                Microseconds::from(((cusec + 1) % 1_000_000).to_be_bytes().to_vec())
            }
            _ => authenticator.cusec.0,
        };
        let encoded_seq_number = match self.tamper {
            ApRepTamper::ZeroSeqNumber => IntegerAsn1::from(vec![0]),
            _ => IntegerAsn1::from_bytes_be_unsigned(seq_number.to_be_bytes().to_vec()),
        };

        let enc_ap_rep_part = EncApRepPart::from(EncApRepPartInner {
            ctime: ExplicitContextTag0::from(ctime),
            cusec: ExplicitContextTag1::from(cusec),
            subkey: Optional::from(self.acceptor_subkey.as_ref().map(|subkey| {
                ExplicitContextTag2::from(EncryptionKey {
                    key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(KDC_ENCRYPTION_TYPE)])),
                    key_value: ExplicitContextTag1::from(OctetStringAsn1::from(subkey.clone())),
                })
            })),
            seq_number: Optional::from(Some(ExplicitContextTag3::from(encoded_seq_number))),
        });

        let enc_part = ticket_encryption_type
            .cipher()
            .encrypt(
                &ticket_session_key,
                AP_REP_ENC,
                &picky_asn1_der::to_vec(&enc_ap_rep_part).unwrap(),
            )
            .unwrap();

        let ap_rep = ApRep::from(ApRepInner {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![5])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AP_REP_MSG_TYPE])),
            enc_part: ExplicitContextTag2::from(EncryptedData {
                etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(ticket_encryption_type.clone())])),
                kvno: Optional::from(None),
                cipher: ExplicitContextTag2::from(OctetStringAsn1::from(enc_part)),
            }),
        });
        let ap_rep = picky_asn1_der::to_vec(&ap_rep).unwrap();

        let (key, encryption_type, acceptor_subkey) = match &self.acceptor_subkey {
            Some(subkey) => (subkey.clone(), KDC_ENCRYPTION_TYPE, true),
            None => (
                initiator_subkey.key_value.0 .0,
                cipher_suite_from_id(&initiator_subkey.key_type.0 .0).unwrap(),
                false,
            ),
        };

        self.session = Some(AcceptorSession {
            ticket_session_key,
            encryption_type,
            key,
            acceptor_subkey,
            checksum: checksum.checksum.0 .0,
            initiator_seq_number,
            seq_number: u64::from(seq_number),
        });

        if self.dce_style {
            ap_rep
        } else {
            gss_token::wrap(&ap_rep, TokenId::ApRep, self.profile).unwrap()
        }
    }

    /// Checks the third leg of the DCE style exchange and returns the initiator sequence number it carries.
    pub fn complete_dce(&self, token: &[u8]) -> u32 {
        let session = self.session();

        let ap_rep: ApRep = picky_asn1_der::from_bytes(token).unwrap();
        let enc_ap_rep_part = session
            .encryption_type
            .cipher()
            .decrypt(&session.ticket_session_key, AP_REP_ENC, &ap_rep.0.enc_part.0.cipher.0 .0)
            .unwrap();
        let enc_ap_rep_part: EncApRepPart = picky_asn1_der::from_bytes(&enc_ap_rep_part).unwrap();

        integer_to_u32(&enc_ap_rep_part.0.seq_number.0.expect("AP-REP has no sequence number").0 .0).unwrap()
    }

    pub fn sign(&mut self, data: &[u8]) -> Vec<u8> {
        let seq_number = self.session().seq_number;
        let token = message_protection::generate_mic_token(false, seq_number, data, &self.key()).unwrap();
        self.session.as_mut().unwrap().seq_number += 1;

        token
    }

    pub fn verify(&self, token: &[u8], data: &[u8]) -> Result<u64> {
        message_protection::validate_mic_token(false, token, data, &self.key())
    }

    pub fn wrap(&mut self, plaintext: &[u8]) -> WrappedMessage {
        let seq_number = self.session().seq_number;
        let wrapped = message_protection::wrap_message(false, seq_number, plaintext, &self.key()).unwrap();
        self.session.as_mut().unwrap().seq_number += 1;

        wrapped
    }

    pub fn unwrap(&self, token: &[u8], data: &[u8]) -> Result<(u64, Vec<u8>)> {
        message_protection::unwrap_message(false, token, data, &self.key())
    }
}
