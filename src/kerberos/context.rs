use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{KerberosTime, PrincipalName, Ticket};

use crate::kerberos::flags::{ApOptions, GssFlags};
use crate::kerberos::KERBEROS_VERSION;
use crate::Secret;

/// Encryption types advertised to the KDC, in preference order.
pub const SUPPORTED_ENCRYPTION_TYPES: [CipherSuite; 2] =
    [CipherSuite::Aes256CtsHmacSha196, CipherSuite::Aes128CtsHmacSha196];

/// Timestamp of the last sent authenticator. The AP-REP must echo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatorTime {
    pub ctime: KerberosTime,
    pub cusec: u32,
}

/// Mutable state of one security context.
#[derive(Debug)]
pub struct KerberosContext {
    pub pvno: u8,
    pub realm: String,
    /// Client principal. Replaced by the canonical name returned in the AS-REP.
    pub cname: Option<PrincipalName>,
    /// Encryption type of the current session key.
    pub encryption_type: Option<CipherSuite>,
    pub supported_encryption_types: Vec<CipherSuite>,
    /// AS session key during the TGS exchange, service session key afterwards and
    /// the negotiated sub-key once the context is established.
    pub session_key: Option<Secret<Vec<u8>>>,
    /// Service ticket session key. Protects the authenticator and the AP-REP.
    pub ap_session_key: Option<Secret<Vec<u8>>>,
    /// Sub-key sent in the authenticator.
    pub sub_key: Option<Secret<Vec<u8>>>,
    /// Ticket-granting ticket after the AS exchange, service ticket after the TGS exchange.
    pub ticket: Option<Ticket>,
    pub ap_options: ApOptions,
    pub checksum_flags: GssFlags,
    pub local_seq_number: u64,
    /// Next sequence number expected from the acceptor.
    pub remote_seq_number: Option<u64>,
    /// Set when the session key is the sub-key chosen by the acceptor.
    pub acceptor_subkey: bool,
    pub authenticator_time: Option<AuthenticatorTime>,
}

impl KerberosContext {
    pub fn new(realm: String) -> Self {
        Self {
            pvno: KERBEROS_VERSION,
            realm,
            cname: None,
            encryption_type: None,
            supported_encryption_types: SUPPORTED_ENCRYPTION_TYPES.to_vec(),
            session_key: None,
            ap_session_key: None,
            sub_key: None,
            ticket: None,
            ap_options: ApOptions::empty(),
            checksum_flags: GssFlags::empty(),
            local_seq_number: 0,
            remote_seq_number: None,
            acceptor_subkey: false,
            authenticator_time: None,
        }
    }

    /// Returns the current sequence number and advances it.
    pub fn next_seq_number(&mut self) -> u64 {
        let seq_number = self.local_seq_number;
        self.local_seq_number = self.local_seq_number.wrapping_add(1);

        seq_number
    }

    /// Forgets keys, tickets and the retained authenticator data. Keys are wiped on drop.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.realm));
    }
}
