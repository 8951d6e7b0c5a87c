use std::fmt;

use sha2::{Digest, Sha256};

use crate::{Error, ErrorKind, Result, Secret};

/// Kind of the account the credentials belong to. Affects the default key derivation salt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum AccountType {
    #[default]
    User,
    Computer,
}

/// Password based logon credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub domain: String,
    pub account_name: String,
    pub password: Secret<String>,
    pub account_type: AccountType,
}

impl Credentials {
    pub fn new(domain: impl Into<String>, account_name: impl Into<String>, password: impl Into<Secret<String>>) -> Self {
        let account_name = account_name.into();
        // machine accounts are named after the computer followed by '$'
        let account_type = if account_name.ends_with('$') {
            AccountType::Computer
        } else {
            AccountType::User
        };

        Self {
            domain: domain.into(),
            account_name,
            password: password.into(),
            account_type,
        }
    }

    /// Parses a down-level logon name (`DOMAIN\account`) or a user principal name (`account@domain`).
    pub fn parse(name: &str, password: impl Into<Secret<String>>) -> Result<Self> {
        let (domain, account_name) = if let Some((domain, account_name)) = name.split_once('\\') {
            (domain, account_name)
        } else if let Some((account_name, domain)) = name.rsplit_once('@') {
            (domain, account_name)
        } else {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("the domain is missing in the account name: {}", name),
            ));
        };

        if domain.is_empty() || account_name.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("invalid account name: {}", name),
            ));
        }

        Ok(Self::new(domain, account_name, password))
    }

    pub fn with_account_type(mut self, account_type: AccountType) -> Self {
        self.account_type = account_type;
        self
    }

    /// Kerberos realm of the account: the upper-cased domain name.
    pub fn realm(&self) -> String {
        self.domain.to_uppercase()
    }

    /// Default salt of the account long-term key.
    ///
    /// [MS-KILE 3.1.1.2](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-kile/4df88a0e-4f9b-4fa5-b6fd-6ba1a1eeeeea):
    /// user accounts use the realm followed by the account name, computer accounts use
    /// the realm, "host", the lower-cased computer name, and the lower-cased realm.
    pub fn salt(&self) -> String {
        let realm = self.realm();

        match self.account_type {
            AccountType::User => format!("{}{}", realm, self.account_name),
            AccountType::Computer => {
                let computer_name = self.account_name.trim_end_matches('$').to_lowercase();

                format!("{}host{}.{}", realm, computer_name, realm.to_lowercase())
            }
        }
    }

    /// Identity of the credentials used as the ticket cache key.
    ///
    /// The password is hashed after the account fields, so a cached ticket is only reused by
    /// credentials that would have obtained it from the KDC themselves.
    pub fn identity(&self) -> CredentialIdentity {
        let mut hasher = Sha256::new();

        hasher.update(self.domain.to_uppercase().as_bytes());
        hasher.update([0]);
        hasher.update(self.account_name.to_lowercase().as_bytes());
        hasher.update([0]);
        hasher.update(match self.account_type {
            AccountType::User => [0],
            AccountType::Computer => [1],
        });
        hasher.update(self.password.as_bytes());

        CredentialIdentity(hasher.finalize().into())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("account_name", &self.account_name)
            .field("password", &self.password)
            .field("account_type", &self.account_type)
            .finish()
    }
}

/// SHA-256 digest of the normalized account name, domain, account type and the password.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct CredentialIdentity([u8; 32]);

impl CredentialIdentity {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for CredentialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialIdentity(0x")?;
        self.0[..8].iter().try_for_each(|byte| write!(f, "{byte:02x}"))?;
        write!(f, "..)")
    }
}
