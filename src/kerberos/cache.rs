use std::collections::HashMap;
use std::sync::RwLock;

use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{PrincipalName, Ticket};

use crate::{CredentialIdentity, Result, Secret};

/// Service ticket obtained by a successful AS and TGS exchange.
#[derive(Debug, Clone)]
pub struct CachedTicket {
    pub ticket: Ticket,
    pub session_key: Secret<Vec<u8>>,
    pub encryption_type: CipherSuite,
    /// Client realm as returned by the KDC (it may canonicalize it).
    pub crealm: String,
    /// Client name as returned by the KDC.
    pub cname: PrincipalName,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    identity: CredentialIdentity,
    server_name: String,
}

impl CacheKey {
    fn new(identity: CredentialIdentity, server_name: &str) -> Self {
        Self {
            identity,
            // principal names are compared case-insensitively
            server_name: server_name.to_lowercase(),
        }
    }
}

/// Service tickets shared by all security contexts of the process.
///
/// Entries are keyed by the credential identity and the target server principal name. There is
/// at most one entry per key and a store overwrites it. Entries are never evicted and their validity
/// window is not checked: an expired ticket is rejected by the server and the caller has to
/// [remove](TicketCache::remove) it before retrying.
///
/// Lookups take the shared lock and run concurrently. A store takes the exclusive lock only for the
/// map mutation. The lock is `std::sync::RwLock`, which on the supported platforms does not let
/// readers starve a waiting writer.
#[derive(Debug, Default)]
pub struct TicketCache {
    entries: RwLock<HashMap<CacheKey, CachedTicket>>,
}

impl TicketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the cached ticket.
    #[instrument(level = "trace", skip(self))]
    pub fn get(&self, identity: &CredentialIdentity, server_name: &str) -> Result<Option<CachedTicket>> {
        let entries = self.entries.read()?;

        Ok(entries.get(&CacheKey::new(*identity, server_name)).cloned())
    }

    /// Inserts the ticket or overwrites the existing entry with the same key.
    #[instrument(level = "trace", skip(self, ticket))]
    pub fn put(&self, identity: &CredentialIdentity, server_name: &str, ticket: CachedTicket) -> Result<()> {
        let key = CacheKey::new(*identity, server_name);

        let previous = self.entries.write()?.insert(key, ticket);
        if previous.is_some() {
            debug!(server_name, "Replaced cached service ticket");
        }

        Ok(())
    }

    pub fn remove(&self, identity: &CredentialIdentity, server_name: &str) -> Result<Option<CachedTicket>> {
        Ok(self.entries.write()?.remove(&CacheKey::new(*identity, server_name)))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.entries.read()?.is_empty())
    }
}
