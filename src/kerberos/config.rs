use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::kerberos::gss_token::TokenProfile;
use crate::transport::NetworkTransport;
use crate::{Error, ErrorKind, Result};

/// Bound of a single KDC round trip.
pub const DEFAULT_KDC_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct KerberosConfig {
    /// KDC address. Used by [KerberosConfig::network_transport].
    pub kdc_url: Option<Url>,
    /// NetBIOS name of the client machine, sent as the request address.
    pub client_computer_name: Option<String>,
    pub timeout: Duration,
    pub token_profile: TokenProfile,
    /// Overrides the salt of the account key.
    pub salt: Option<String>,
}

impl Debug for KerberosConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KerberosConfig")
            .field("kdc_url", &self.kdc_url)
            .field("timeout", &self.timeout)
            .field("token_profile", &self.token_profile)
            .finish_non_exhaustive()
    }
}

impl Default for KerberosConfig {
    fn default() -> Self {
        Self {
            kdc_url: None,
            client_computer_name: None,
            timeout: DEFAULT_KDC_TIMEOUT,
            token_profile: TokenProfile::default(),
            salt: None,
        }
    }
}

/// Parses the KDC address. An address without a scheme is reached over TCP.
pub fn parse_kdc_url(kdc: &str) -> Result<Url> {
    if kdc.contains("://") {
        Ok(Url::from_str(kdc)?)
    } else {
        Ok(Url::from_str(&format!("tcp://{}", kdc))?)
    }
}

impl KerberosConfig {
    pub fn new(kdc_url: &str) -> Result<Self> {
        Ok(Self {
            kdc_url: Some(parse_kdc_url(kdc_url)?),
            ..Default::default()
        })
    }

    pub fn with_client_computer_name(mut self, client_computer_name: impl Into<String>) -> Self {
        self.client_computer_name = Some(client_computer_name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_token_profile(mut self, token_profile: TokenProfile) -> Self {
        self.token_profile = token_profile;
        self
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    /// Creates the TCP/UDP transport for the configured KDC.
    pub fn network_transport(&self) -> Result<NetworkTransport> {
        let url = self
            .kdc_url
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::NoAuthenticatingAuthority, "KDC url is not configured"))?;

        NetworkTransport::new(url)
    }
}
