use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use kerberos_sspi_client::{Error, ErrorKind, KdcTransport, PduKind, Result};
use picky_asn1::date::GeneralizedTime;
use picky_asn1::restricted_string::IA5String;
use picky_asn1::wrapper::{
    Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag10, ExplicitContextTag12,
    ExplicitContextTag2, ExplicitContextTag3, ExplicitContextTag4, ExplicitContextTag5, ExplicitContextTag6,
    ExplicitContextTag7, ExplicitContextTag9, IntegerAsn1, OctetStringAsn1, Optional,
};
use picky_asn1_der::application_tag::ApplicationTag;
use picky_krb::constants::error_codes::{
    KDC_ERR_PREAUTH_FAILED, KDC_ERR_PREAUTH_REQUIRED, KDC_ERR_S_PRINCIPAL_UNKNOWN, KRB_AP_ERR_MODIFIED,
};
use picky_krb::constants::key_usages::{
    AS_REP_ENC, TGS_REP_ENC_SESSION_KEY, TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR, TICKET_REP,
};
use picky_krb::constants::types::{
    AS_REP_MSG_TYPE, ENC_AS_REP_PART_TYPE, ENC_TGS_REP_PART_TYPE, NT_SRV_INST, PA_ENC_TIMESTAMP,
    PA_ENC_TIMESTAMP_KEY_USAGE, PA_ETYPE_INFO2_TYPE, PA_TGS_REQ_TYPE, TGS_REP_MSG_TYPE,
};
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{
    Authenticator, EncTicketPart, EncTicketPartInner, EncryptedData, EncryptionKey, EtypeInfo2Entry, KerberosFlags,
    KerberosStringAsn1, KerberosTime, LastReq, LastReqInner, Microseconds, PaData, PaEncTsEnc, PrincipalName, Realm,
    Ticket, TicketInner, TransitedEncoding,
};
use picky_krb::messages::{
    ApReq, AsRep, AsReq, EncKdcRepPart, KdcRep, KdcReqBody, KrbError, KrbErrorInner, TgsRep, TgsReq,
};
use rand::rngs::OsRng;
use rand::RngCore;
use time::{Duration, OffsetDateTime};

/// Encryption type of every key issued by the mock.
pub const KDC_ENCRYPTION_TYPE: CipherSuite = CipherSuite::Aes256CtsHmacSha196;

const KERBEROS_VERSION: u8 = 5;
const KRB_ERROR_MSG_TYPE: u8 = 30;
const TICKET_LIFETIME_HOURS: i64 = 10;

pub struct PasswordCreds {
    pub password: String,
    pub salt: String,
}

/// How the mock answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KdcBehavior {
    #[default]
    Normal,
    /// Answers the first AS-REQ with the given error code instead of KDC_ERR_PREAUTH_REQUIRED.
    RejectAsReq(u32),
    /// Never answers.
    Silent,
}

struct KdcState {
    realm: String,
    krbtgt_key: Vec<u8>,
    /// Account name to password credentials.
    users: HashMap<String, PasswordCreds>,
    /// Service principal name (`service/host`) to the service long-term key.
    services: HashMap<String, Vec<u8>>,
    behavior: KdcBehavior,
    received: Vec<PduKind>,
}

/// Simple mock of the KDC server.
///
/// Clones share the same database and request log, so the test keeps one clone to inspect
/// what the client sent. The request awaiting its reply belongs to the clone.
#[derive(Clone)]
pub struct KdcMock {
    state: Arc<Mutex<KdcState>>,
    pending: Option<Vec<u8>>,
}

impl std::fmt::Debug for KdcMock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KdcMock").finish_non_exhaustive()
    }
}

pub fn random_key() -> Vec<u8> {
    let mut key = vec![0; KDC_ENCRYPTION_TYPE.cipher().key_size()];
    OsRng.fill_bytes(&mut key);

    key
}

fn kerberos_string(value: &str) -> KerberosStringAsn1 {
    KerberosStringAsn1::from(IA5String::from_string(value.to_owned()).unwrap())
}

pub fn principal_name(name_type: u8, names: &[&str]) -> PrincipalName {
    PrincipalName {
        name_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![name_type])),
        name_string: ExplicitContextTag1::from(Asn1SequenceOf::from(
            names.iter().map(|name| kerberos_string(name)).collect::<Vec<_>>(),
        )),
    }
}

pub fn principal_to_string(name: &PrincipalName) -> String {
    name.name_string
        .0
         .0
        .iter()
        .map(|part| part.to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn encrypted_data(cipher: Vec<u8>) -> EncryptedData {
    EncryptedData {
        etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(KDC_ENCRYPTION_TYPE)])),
        kvno: Optional::from(None),
        cipher: ExplicitContextTag2::from(OctetStringAsn1::from(cipher)),
    }
}

fn find_pa_data<'a>(pa_datas: Option<&'a Asn1SequenceOf<PaData>>, pa_type: &[u8]) -> Option<&'a PaData> {
    pa_datas?
        .0
        .iter()
        .find(|pa_data| pa_data.padata_type.0 .0 == pa_type)
}

struct MakeTicketParams<'a> {
    realm: &'a Realm,
    sname: PrincipalName,
    cname: PrincipalName,
    session_key: Vec<u8>,
    ticket_encryption_key: &'a [u8],
    kdc_options: KerberosFlags,
}

fn make_ticket(params: MakeTicketParams<'_>) -> Ticket {
    let MakeTicketParams {
        realm,
        sname,
        cname,
        session_key,
        ticket_encryption_key,
        kdc_options,
    } = params;

    let auth_time = OffsetDateTime::now_utc();

    let ticket_enc_part = EncTicketPart::from(EncTicketPartInner {
        flags: ExplicitContextTag0::from(kdc_options),
        key: ExplicitContextTag1::from(EncryptionKey {
            key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(KDC_ENCRYPTION_TYPE)])),
            key_value: ExplicitContextTag1::from(OctetStringAsn1::from(session_key)),
        }),
        crealm: ExplicitContextTag2::from(realm.clone()),
        cname: ExplicitContextTag3::from(cname),
        transited: ExplicitContextTag4::from(TransitedEncoding {
            tr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![0])),
            contents: ExplicitContextTag1::from(OctetStringAsn1::from(vec![1])),
        }),
        auth_time: ExplicitContextTag5::from(KerberosTime::from(GeneralizedTime::from(auth_time))),
        starttime: Optional::from(None),
        endtime: ExplicitContextTag7::from(KerberosTime::from(GeneralizedTime::from(
            auth_time + Duration::hours(TICKET_LIFETIME_HOURS),
        ))),
        renew_till: Optional::from(None),
        caddr: Optional::from(None),
        authorization_data: Optional::from(None),
    });

    let ticket_enc_data = KDC_ENCRYPTION_TYPE
        .cipher()
        .encrypt(
            ticket_encryption_key,
            TICKET_REP,
            &picky_asn1_der::to_vec(&ticket_enc_part).unwrap(),
        )
        .unwrap();

    Ticket::from(TicketInner {
        tkt_vno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        realm: ExplicitContextTag1::from(realm.clone()),
        sname: ExplicitContextTag2::from(sname),
        enc_part: ExplicitContextTag3::from(encrypted_data(ticket_enc_data)),
    })
}

fn make_rep_enc_part<const TAG: u8>(
    realm: &Realm,
    sname: PrincipalName,
    session_key: Vec<u8>,
    nonce: IntegerAsn1,
    kdc_options: KerberosFlags,
) -> Vec<u8> {
    let auth_time = OffsetDateTime::now_utc();

    let enc_part = ApplicationTag::<_, TAG>::from(EncKdcRepPart {
        key: ExplicitContextTag0::from(EncryptionKey {
            key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(KDC_ENCRYPTION_TYPE)])),
            key_value: ExplicitContextTag1::from(OctetStringAsn1::from(session_key)),
        }),
        last_req: ExplicitContextTag1::from(LastReq::from(vec![LastReqInner {
            lr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![0])),
            lr_value: ExplicitContextTag1::from(KerberosTime::from(GeneralizedTime::from(
                auth_time - Duration::minutes(1),
            ))),
        }])),
        nonce: ExplicitContextTag2::from(nonce),
        key_expiration: Optional::from(None),
        flags: ExplicitContextTag4::from(kdc_options),
        auth_time: ExplicitContextTag5::from(KerberosTime::from(GeneralizedTime::from(auth_time))),
        start_time: Optional::from(Some(ExplicitContextTag6::from(KerberosTime::from(
            GeneralizedTime::from(auth_time),
        )))),
        end_time: ExplicitContextTag7::from(KerberosTime::from(GeneralizedTime::from(
            auth_time + Duration::hours(TICKET_LIFETIME_HOURS),
        ))),
        renew_till: Optional::from(None),
        srealm: ExplicitContextTag9::from(realm.clone()),
        sname: ExplicitContextTag10::from(sname),
        caadr: Optional::from(None),
        encrypted_pa_data: Optional::from(None),
    });

    picky_asn1_der::to_vec(&enc_part).unwrap()
}

impl KdcState {
    fn realm(&self) -> Realm {
        Realm::from(IA5String::from_string(self.realm.clone()).unwrap())
    }

    fn krbtgt_name(&self) -> PrincipalName {
        principal_name(NT_SRV_INST, &["krbtgt", &self.realm])
    }

    fn gen_err(&self, error_code: u32, salt: Option<&str>) -> KrbError {
        let current_date = OffsetDateTime::now_utc();
        let microseconds = current_date.microsecond().min(999_999);

        let e_data = salt.map(|salt| {
            let etype_info2 = Asn1SequenceOf::from(vec![EtypeInfo2Entry {
                etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(KDC_ENCRYPTION_TYPE)])),
                salt: Optional::from(Some(ExplicitContextTag1::from(kerberos_string(salt)))),
                s2kparams: Optional::from(None),
            }]);

            ExplicitContextTag12::from(OctetStringAsn1::from(
                picky_asn1_der::to_vec(&Asn1SequenceOf::from(vec![
                    PaData {
                        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_ETYPE_INFO2_TYPE.to_vec())),
                        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(
                            picky_asn1_der::to_vec(&etype_info2).unwrap(),
                        )),
                    },
                    PaData {
                        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_ENC_TIMESTAMP.to_vec())),
                        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(Vec::new())),
                    },
                ]))
                .unwrap(),
            ))
        });

        KrbError::from(KrbErrorInner {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![KRB_ERROR_MSG_TYPE])),
            ctime: Optional::from(None),
            cusec: Optional::from(None),
            stime: ExplicitContextTag4::from(KerberosTime::from(GeneralizedTime::from(current_date))),
            susec: ExplicitContextTag5::from(Microseconds::from(microseconds.to_be_bytes().to_vec())),
            error_code: ExplicitContextTag6::from(error_code),
            crealm: Optional::from(None),
            cname: Optional::from(None),
            realm: ExplicitContextTag9::from(self.realm()),
            sname: ExplicitContextTag10::from(self.krbtgt_name()),
            e_text: Optional::from(None),
            e_data: Optional::from(e_data),
        })
    }

    fn as_exchange(&self, as_req: AsReq) -> std::result::Result<AsRep, KrbError> {
        let pa_datas = as_req.0.padata.0.as_ref().map(|pa_datas| &pa_datas.0);
        let req_body: KdcReqBody = as_req.0.req_body.0.clone();

        let cname = req_body
            .cname
            .0
            .clone()
            .map(|cname| cname.0)
            .ok_or_else(|| self.gen_err(KDC_ERR_PREAUTH_FAILED, None))?;
        let user = self
            .users
            .get(&principal_to_string(&cname))
            .ok_or_else(|| self.gen_err(KDC_ERR_PREAUTH_FAILED, None))?;

        if let KdcBehavior::RejectAsReq(error_code) = self.behavior {
            return Err(self.gen_err(error_code, None));
        }

        let pa_enc_timestamp = find_pa_data(pa_datas, &PA_ENC_TIMESTAMP)
            .ok_or_else(|| self.gen_err(KDC_ERR_PREAUTH_REQUIRED, Some(user.salt.as_str())))?;

        let user_key = KDC_ENCRYPTION_TYPE
            .cipher()
            .generate_key_from_password(user.password.as_bytes(), user.salt.as_bytes())
            .unwrap();

        let enc_data: EncryptedData = picky_asn1_der::from_bytes(&pa_enc_timestamp.padata_data.0 .0)
            .map_err(|_| self.gen_err(KDC_ERR_PREAUTH_FAILED, None))?;
        let timestamp = KDC_ENCRYPTION_TYPE
            .cipher()
            .decrypt(&user_key, PA_ENC_TIMESTAMP_KEY_USAGE, &enc_data.cipher.0 .0)
            .map_err(|_| self.gen_err(KDC_ERR_PREAUTH_FAILED, None))?;
        let _: PaEncTsEnc =
            picky_asn1_der::from_bytes(&timestamp).map_err(|_| self.gen_err(KDC_ERR_PREAUTH_FAILED, None))?;

        let realm = self.realm();
        let session_key = random_key();
        let kdc_options = req_body.kdc_options.0.clone();

        let ticket = make_ticket(MakeTicketParams {
            realm: &realm,
            sname: self.krbtgt_name(),
            cname: cname.clone(),
            session_key: session_key.clone(),
            ticket_encryption_key: &self.krbtgt_key,
            kdc_options: kdc_options.clone(),
        });

        let enc_part = make_rep_enc_part::<ENC_AS_REP_PART_TYPE>(
            &realm,
            self.krbtgt_name(),
            session_key,
            req_body.nonce.0.clone(),
            kdc_options,
        );
        let enc_part = KDC_ENCRYPTION_TYPE
            .cipher()
            .encrypt(&user_key, AS_REP_ENC, &enc_part)
            .unwrap();

        Ok(AsRep::from(KdcRep {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AS_REP_MSG_TYPE])),
            padata: Optional::from(None),
            crealm: ExplicitContextTag3::from(realm),
            cname: ExplicitContextTag4::from(cname),
            ticket: ExplicitContextTag5::from(ticket),
            enc_part: ExplicitContextTag6::from(encrypted_data(enc_part)),
        }))
    }

    fn tgs_exchange(&self, tgs_req: TgsReq) -> std::result::Result<TgsRep, KrbError> {
        let pa_datas = tgs_req.0.padata.0.as_ref().map(|pa_datas| &pa_datas.0);
        let req_body: KdcReqBody = tgs_req.0.req_body.0.clone();

        let pa_tgs_req = find_pa_data(pa_datas, &PA_TGS_REQ_TYPE)
            .ok_or_else(|| self.gen_err(KDC_ERR_PREAUTH_REQUIRED, None))?;
        let ap_req: ApReq = picky_asn1_der::from_bytes(&pa_tgs_req.padata_data.0 .0)
            .map_err(|_| self.gen_err(KDC_ERR_PREAUTH_FAILED, None))?;

        let tgt_enc_part = KDC_ENCRYPTION_TYPE
            .cipher()
            .decrypt(&self.krbtgt_key, TICKET_REP, &ap_req.0.ticket.0 .0.enc_part.0.cipher.0 .0)
            .map_err(|_| self.gen_err(KRB_AP_ERR_MODIFIED, None))?;
        let tgt_enc_part: EncTicketPart =
            picky_asn1_der::from_bytes(&tgt_enc_part).map_err(|_| self.gen_err(KRB_AP_ERR_MODIFIED, None))?;
        let tgs_session_key = tgt_enc_part.0.key.0.key_value.0 .0.clone();

        let authenticator = KDC_ENCRYPTION_TYPE
            .cipher()
            .decrypt(
                &tgs_session_key,
                TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR,
                &ap_req.0.authenticator.0.cipher.0 .0,
            )
            .map_err(|_| self.gen_err(KRB_AP_ERR_MODIFIED, None))?;
        let authenticator: Authenticator =
            picky_asn1_der::from_bytes(&authenticator).map_err(|_| self.gen_err(KRB_AP_ERR_MODIFIED, None))?;
        // the TGS-REQ body is bound by a keyed checksum
        if authenticator.0.cksum.0.is_none() {
            return Err(self.gen_err(KRB_AP_ERR_MODIFIED, None));
        }

        let sname = req_body
            .sname
            .0
            .clone()
            .map(|sname| sname.0)
            .ok_or_else(|| self.gen_err(KDC_ERR_S_PRINCIPAL_UNKNOWN, None))?;
        let service_key = self
            .services
            .get(&principal_to_string(&sname).to_lowercase())
            .ok_or_else(|| self.gen_err(KDC_ERR_S_PRINCIPAL_UNKNOWN, None))?;

        let realm = self.realm();
        let service_session_key = random_key();
        let cname = tgt_enc_part.0.cname.0.clone();
        let kdc_options = req_body.kdc_options.0.clone();

        let ticket = make_ticket(MakeTicketParams {
            realm: &realm,
            sname: sname.clone(),
            cname: cname.clone(),
            session_key: service_session_key.clone(),
            ticket_encryption_key: service_key,
            kdc_options: kdc_options.clone(),
        });

        let enc_part = make_rep_enc_part::<ENC_TGS_REP_PART_TYPE>(
            &realm,
            sname,
            service_session_key,
            req_body.nonce.0.clone(),
            kdc_options,
        );
        let enc_part = KDC_ENCRYPTION_TYPE
            .cipher()
            .encrypt(&tgs_session_key, TGS_REP_ENC_SESSION_KEY, &enc_part)
            .unwrap();

        Ok(TgsRep::from(KdcRep {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![TGS_REP_MSG_TYPE])),
            padata: Optional::from(None),
            crealm: ExplicitContextTag3::from(tgt_enc_part.0.crealm.0.clone()),
            cname: ExplicitContextTag4::from(cname),
            ticket: ExplicitContextTag5::from(ticket),
            enc_part: ExplicitContextTag6::from(encrypted_data(enc_part)),
        }))
    }
}

impl KdcMock {
    pub fn new(realm: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(KdcState {
                realm: realm.to_owned(),
                krbtgt_key: random_key(),
                users: HashMap::new(),
                services: HashMap::new(),
                behavior: KdcBehavior::Normal,
                received: Vec::new(),
            })),
            pending: None,
        }
    }

    pub fn with_user(self, account_name: &str, password: &str, salt: &str) -> Self {
        self.state.lock().unwrap().users.insert(
            account_name.to_owned(),
            PasswordCreds {
                password: password.to_owned(),
                salt: salt.to_owned(),
            },
        );

        self
    }

    pub fn with_service(self, service_principal_name: &str, key: Vec<u8>) -> Self {
        self.state
            .lock()
            .unwrap()
            .services
            .insert(service_principal_name.to_lowercase(), key);

        self
    }

    pub fn set_behavior(&self, behavior: KdcBehavior) {
        self.state.lock().unwrap().behavior = behavior;
    }

    /// Kinds of all PDUs sent to the KDC so far.
    pub fn received(&self) -> Vec<PduKind> {
        self.state.lock().unwrap().received.clone()
    }
}

impl KdcTransport for KdcMock {
    fn send(&mut self, pdu: &[u8]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .received
            .push(PduKind::from_pdu(pdu).expect("client sent an unknown PDU"));
        self.pending = Some(pdu.to_vec());

        Ok(())
    }

    fn expect(&mut self, timeout: StdDuration, _expected: PduKind) -> Result<Vec<u8>> {
        let request = self.pending.take().expect("expect called without send");
        let state = self.state.lock().unwrap();

        if state.behavior == KdcBehavior::Silent {
            return Err(Error::new(
                ErrorKind::TimeoutError,
                format!("KDC did not answer within {:?}", timeout),
            ));
        }

        let reply = match PduKind::from_pdu(&request) {
            Some(PduKind::AsReq) => {
                let as_req: AsReq = picky_asn1_der::from_bytes(&request).unwrap();

                match state.as_exchange(as_req) {
                    Ok(as_rep) => picky_asn1_der::to_vec(&as_rep),
                    Err(krb_error) => picky_asn1_der::to_vec(&krb_error),
                }
            }
            Some(PduKind::TgsReq) => {
                let tgs_req: TgsReq = picky_asn1_der::from_bytes(&request).unwrap();

                match state.tgs_exchange(tgs_req) {
                    Ok(tgs_rep) => picky_asn1_der::to_vec(&tgs_rep),
                    Err(krb_error) => picky_asn1_der::to_vec(&krb_error),
                }
            }
            kind => panic!("KDC cannot process {:?}", kind),
        };

        Ok(reply.unwrap())
    }
}
