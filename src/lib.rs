//! Client side of the Kerberos V5 protocol (RFC 4120) exposed as a GSS-API style
//! security context (RFC 4121).
//!
//! The entry point is [`KerberosClient`]: it drives the AS, TGS and AP exchanges against a KDC
//! reachable through a [`KdcTransport`], shares service tickets between contexts through a
//! [`TicketCache`] and, once established, protects messages with [`KerberosClient::sign`],
//! [`KerberosClient::verify`], [`KerberosClient::encrypt`] and [`KerberosClient::decrypt`].

#[macro_use]
extern crate tracing;

pub mod credentials;
pub mod crypto;
pub mod kerberos;
mod secret;
pub mod security_buffer;
pub mod transport;

use std::sync::PoisonError;
use std::{error, fmt, io};

use picky_asn1::restricted_string::CharSetError;
use picky_asn1_der::Asn1DerError;
use picky_krb::crypto::KerberosCryptoError;
use picky_krb::gss_api::GssApiMessageError;

pub use crate::credentials::{AccountType, CredentialIdentity, Credentials};
pub use crate::crypto::{KerberosCrypto, PickyCrypto};
pub use crate::kerberos::cache::{CachedTicket, TicketCache};
pub use crate::kerberos::config::KerberosConfig;
pub use crate::kerberos::flags::{map_context_requirements, ApOptions, ClientRequestFlags, GssFlags, KdcOptions};
pub use crate::kerberos::gss_token::{TokenId, TokenProfile};
pub use crate::kerberos::{KerberosClient, KerberosState};
pub use crate::secret::Secret;
pub use crate::security_buffer::{BufferType, SecurityBuffer};
pub use crate::transport::{KdcTransport, NetworkTransport, PduKind};

/// Representation of a security package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: &'static str,
    pub comment: &'static str,
    pub max_token_len: u32,
}

/// Size limits of the buffers used by the message protection operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSizes {
    pub max_token: u32,
    pub max_signature: u32,
    pub block: u32,
    pub security_trailer: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecurityStatus {
    Ok,
    ContinueNeeded,
}

/// Result of a single [`KerberosClient::initialize`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeSecurityContextResult {
    pub status: SecurityStatus,
    /// Token that has to be delivered to the peer, if any.
    pub output_token: Option<Vec<u8>>,
}

impl InitializeSecurityContextResult {
    pub fn continue_needed(&self) -> bool {
        self.status == SecurityStatus::ContinueNeeded
    }
}

/// The kind of an error. Every kind is fatal to the exchange in progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unexpected PDU type or KDC error code.
    ProtocolViolation,
    /// Integrity or mutual authentication check failed.
    ValidationFailure,
    /// Truncated or malformed token or message.
    FormatError,
    /// A key required by the operation is missing.
    ResourceError,
    /// The KDC did not answer within the configured bound.
    TimeoutError,
    /// Operation is not allowed in the current context state.
    OutOfSequence,
    InvalidParameter,
    /// The KDC is unreachable.
    NoAuthenticatingAuthority,
    /// May correspond to any internal error (lock poisoning, unexpected I/O failure, etc.).
    InternalError,
}

/// Holds the [`ErrorKind`] and the description of the error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub error_type: ErrorKind,
    pub description: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Allows to fill a new error easily, supplying it with a coherent description.
    pub fn new(error_type: ErrorKind, description: impl ToString) -> Self {
        Self {
            error_type,
            description: description.to_string(),
        }
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.error_type, self.description)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Self::new(ErrorKind::TimeoutError, format!("KDC did not answer in time: {:?}", err))
            }
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::NotFound => {
                Self::new(ErrorKind::NoAuthenticatingAuthority, format!("KDC is unreachable: {:?}", err))
            }
            _ => Self::new(ErrorKind::InternalError, format!("IO error: {:?}", err)),
        }
    }
}

impl From<Asn1DerError> for Error {
    fn from(err: Asn1DerError) -> Self {
        Self::new(ErrorKind::FormatError, format!("ASN1 DER error: {:?}", err))
    }
}

impl From<KerberosCryptoError> for Error {
    fn from(err: KerberosCryptoError) -> Self {
        match err {
            KerberosCryptoError::IntegrityCheck => Self::new(ErrorKind::ValidationFailure, "integrity check failed"),
            err => Self::new(ErrorKind::InternalError, format!("Kerberos crypto error: {:?}", err)),
        }
    }
}

impl From<GssApiMessageError> for Error {
    fn from(err: GssApiMessageError) -> Self {
        Self::new(ErrorKind::FormatError, format!("invalid GSS-API token: {:?}", err))
    }
}

impl From<CharSetError> for Error {
    fn from(err: CharSetError) -> Self {
        Self::new(ErrorKind::FormatError, format!("invalid character set: {:?}", err))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::new(ErrorKind::InvalidParameter, format!("invalid KDC url: {:?}", err))
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Self::new(ErrorKind::InternalError, "ticket cache lock is poisoned")
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, format!("{:?}: {}", err.error_type, err.description))
    }
}
