pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod flags;
pub mod gss_token;
pub mod message_protection;

use std::sync::Arc;

use picky_krb::crypto::CipherSuite;

use self::cache::TicketCache;
use self::config::KerberosConfig;
use self::context::KerberosContext;
use self::flags::ClientRequestFlags;
use self::message_protection::ProtectionKey;
use crate::crypto::{KerberosCrypto, PickyCrypto};
use crate::security_buffer::{BufferType, SecurityBuffer};
use crate::transport::KdcTransport;
use crate::{ContextSizes, Credentials, Error, ErrorKind, InitializeSecurityContextResult, PackageInfo, Result, Secret};

pub const PKG_NAME: &str = "Kerberos";
pub const KERBEROS_VERSION: u8 = 0x05;
pub const TGT_SERVICE_NAME: &str = "krbtgt";

/// MIC token header (16 bytes) and the HMAC-SHA1-96 checksum.
pub const MAX_SIGNATURE: u32 = 28;
/// Wrap token header, confounder, encrypted header copy and HMAC-SHA1-96 checksum of the AES etypes.
pub const SECURITY_TRAILER: u32 = 60;

pub const PACKAGE_INFO: PackageInfo = PackageInfo {
    name: PKG_NAME,
    comment: "Kerberos Security Package",
    max_token_len: 0xbb80, // 48 000 bytes: default maximum token len in Windows
};

/// Progress of the security context establishment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum KerberosState {
    #[default]
    Uninitialized,
    /// The KDC asked for pre-authentication.
    PreauthPending,
    /// The ticket-granting ticket is obtained.
    AsIssued,
    /// The service ticket is obtained.
    TgsIssued,
    /// The AP-REQ token is built.
    TokenProduced,
    /// Waiting for the AP-REP of the acceptor.
    ContinuePending,
    Established,
}

/// Client side of a Kerberos security context.
///
/// Obtains the tickets from the KDC through the [KdcTransport], builds the AP-REQ token for the
/// target server and, once established, protects the messages exchanged with it.
#[derive(Debug)]
pub struct KerberosClient {
    config: KerberosConfig,
    credentials: Credentials,
    target_name: String,
    context_requirements: ClientRequestFlags,
    transport: Box<dyn KdcTransport>,
    crypto: Box<dyn KerberosCrypto>,
    cache: Arc<TicketCache>,
    state: KerberosState,
    context: KerberosContext,
    /// Token produced by the last [KerberosClient::initialize] call.
    token: Option<Vec<u8>>,
}

impl KerberosClient {
    pub fn new(
        config: KerberosConfig,
        credentials: Credentials,
        target_name: &str,
        context_requirements: ClientRequestFlags,
        transport: Box<dyn KdcTransport>,
        cache: Arc<TicketCache>,
    ) -> Self {
        let realm = credentials.realm();

        Self {
            config,
            credentials,
            target_name: target_name.to_owned(),
            context_requirements,
            transport,
            crypto: Box::new(PickyCrypto),
            cache,
            state: KerberosState::Uninitialized,
            context: KerberosContext::new(realm),
            token: None,
        }
    }

    /// Connects to the KDC configured in [KerberosConfig::kdc_url].
    pub fn with_network_transport(
        config: KerberosConfig,
        credentials: Credentials,
        target_name: &str,
        context_requirements: ClientRequestFlags,
        cache: Arc<TicketCache>,
    ) -> Result<Self> {
        let transport = Box::new(config.network_transport()?);

        Ok(Self::new(
            config,
            credentials,
            target_name,
            context_requirements,
            transport,
            cache,
        ))
    }

    pub fn with_crypto(mut self, crypto: Box<dyn KerberosCrypto>) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn state(&self) -> KerberosState {
        self.state
    }

    pub fn config(&self) -> &KerberosConfig {
        &self.config
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Token produced by the last [KerberosClient::initialize] call.
    pub fn token(&self) -> Option<&[u8]> {
        self.token.as_deref()
    }

    /// Key protecting the messages once the context is established.
    pub fn session_key(&self) -> Option<&Secret<Vec<u8>>> {
        self.context.session_key.as_ref()
    }

    pub fn encryption_type(&self) -> Option<&CipherSuite> {
        self.context.encryption_type.as_ref()
    }

    /// Next local sequence number.
    pub fn sequence_number(&self) -> u64 {
        self.context.local_seq_number
    }

    pub fn package_info(&self) -> PackageInfo {
        PACKAGE_INFO
    }

    pub fn context_sizes(&self) -> ContextSizes {
        ContextSizes {
            max_token: PACKAGE_INFO.max_token_len,
            max_signature: MAX_SIGNATURE,
            block: 1,
            security_trailer: SECURITY_TRAILER,
        }
    }

    /// Drives the context establishment.
    ///
    /// Without a token a new exchange is started. The token returned by the acceptor continues the
    /// exchange that asked for it. A failure resets the context to [KerberosState::Uninitialized].
    #[instrument(level = "debug", ret, fields(state = ?self.state), skip_all)]
    pub fn initialize(&mut self, input_token: Option<&[u8]>) -> Result<InitializeSecurityContextResult> {
        match client::initialize_security_context(self, input_token) {
            Ok(result) => Ok(result),
            Err(err) => {
                error!(?err, "Kerberos security context initialization failed");
                self.reset();

                Err(err)
            }
        }
    }

    fn reset(&mut self) {
        self.state = KerberosState::Uninitialized;
        self.context.reset();
        self.token = None;
    }

    fn established_key(&self) -> Result<ProtectionKey<'_>> {
        if self.state != KerberosState::Established {
            return Err(Error::new(
                ErrorKind::OutOfSequence,
                "Kerberos context is not established",
            ));
        }

        let key = self
            .context
            .session_key
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::ResourceError, "session key is not set"))?;
        let encryption_type = self
            .context
            .encryption_type
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::ResourceError, "encryption type is not negotiated"))?;

        Ok(ProtectionKey {
            crypto: self.crypto.as_ref(),
            encryption_type,
            key: key.as_ref(),
            acceptor_subkey: self.context.acceptor_subkey,
        })
    }

    /// Rejects sequence numbers below the next expected one when replay detection was requested.
    ///
    /// The next expected number only moves forward: an older message accepted without replay
    /// detection leaves it unchanged.
    fn accept_remote_seq_number(&mut self, seq_number: u64) -> bool {
        let replay_detect = self.context_requirements.contains(ClientRequestFlags::REPLAY_DETECT);
        let next = seq_number.saturating_add(1);

        match self.context.remote_seq_number {
            Some(expected) if seq_number < expected => {
                if replay_detect {
                    warn!(seq_number, expected, "Replayed message");

                    return false;
                }
                debug!(seq_number, expected, "Out of order message");
            }
            _ => self.context.remote_seq_number = Some(next),
        }

        true
    }

    /// Computes the MIC of the `Data` buffers into the `Token` buffer.
    #[instrument(level = "debug", ret, fields(state = ?self.state), skip_all)]
    pub fn sign(&mut self, message: &mut [SecurityBuffer]) -> Result<()> {
        let seq_number = self.context.local_seq_number;
        let data = SecurityBuffer::collect_data(message);

        let token = message_protection::generate_mic_token(true, seq_number, &data, &self.established_key()?)?;

        SecurityBuffer::find_buffer_mut(message, BufferType::Token)?.buffer = token;
        self.context.next_seq_number();

        Ok(())
    }

    /// Checks the MIC in the `Token` buffer against the `Data` buffers.
    ///
    /// Returns `false` when the checksum does not match or the message is replayed.
    #[instrument(level = "debug", ret, fields(state = ?self.state), skip_all)]
    pub fn verify(&mut self, message: &[SecurityBuffer]) -> Result<bool> {
        let token = &SecurityBuffer::find_buffer(message, BufferType::Token)?.buffer;
        let data = SecurityBuffer::collect_data(message);

        let seq_number = match message_protection::validate_mic_token(true, token, &data, &self.established_key()?) {
            Ok(seq_number) => seq_number,
            Err(err) if err.error_type == ErrorKind::ValidationFailure => {
                warn!(?err, "MIC token verification failed");

                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        Ok(self.accept_remote_seq_number(seq_number))
    }

    /// Seals the `Data` buffers in place and writes the Wrap token header and trailer into the `Token` buffer.
    #[instrument(level = "debug", ret, fields(state = ?self.state), skip_all)]
    pub fn encrypt(&mut self, message: &mut [SecurityBuffer]) -> Result<()> {
        // checks if the Token buffer present
        SecurityBuffer::find_buffer(message, BufferType::Token)?;

        let seq_number = self.context.local_seq_number;
        let plaintext = SecurityBuffer::collect_data(message);

        let wrapped = message_protection::wrap_message(true, seq_number, &plaintext, &self.established_key()?)?;

        SecurityBuffer::scatter_data(message, &wrapped.data)?;
        SecurityBuffer::find_buffer_mut(message, BufferType::Token)?.buffer = wrapped.token;
        self.context.next_seq_number();

        Ok(())
    }

    /// Opens the Wrap token spread over the `Token` and `Data` buffers and writes the plaintext into the `Data` buffers.
    ///
    /// Returns `false` when the integrity check does not pass or the message is replayed. The buffers are
    /// left untouched in that case.
    #[instrument(level = "debug", ret, fields(state = ?self.state), skip_all)]
    pub fn decrypt(&mut self, message: &mut [SecurityBuffer]) -> Result<bool> {
        let token = SecurityBuffer::find_buffer(message, BufferType::Token)?.buffer.clone();
        let encrypted = SecurityBuffer::collect_data(message);

        let (seq_number, plaintext) =
            match message_protection::unwrap_message(true, &token, &encrypted, &self.established_key()?) {
                Ok(unwrapped) => unwrapped,
                Err(err) if err.error_type == ErrorKind::ValidationFailure => {
                    warn!(?err, "Wrap token decryption failed");

                    return Ok(false);
                }
                Err(err) => return Err(err),
            };

        if !self.accept_remote_seq_number(seq_number) {
            return Ok(false);
        }

        SecurityBuffer::scatter_data(message, &plaintext)?;

        Ok(true)
    }
}
