#![allow(dead_code)]

pub mod acceptor;
pub mod kdc;

use std::sync::{Arc, Once};

use kerberos_sspi_client::{ClientRequestFlags, Credentials, KerberosClient, KerberosConfig, TicketCache};
use tracing_subscriber::EnvFilter;

use self::acceptor::MockAcceptor;
use self::kdc::{random_key, KdcMock};

pub const DOMAIN: &str = "contoso.com";
pub const REALM: &str = "CONTOSO.COM";
pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "Passw0rd!";
pub const TARGET_NAME: &str = "host/server1.contoso.com";

static LOGGING: Once = Once::new();

/// Prints the library traces when `RUST_LOG` is set.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Represents a Kerberos environment:
/// * the KDC with the user account and the target service;
/// * the service long-term key;
/// * the ticket cache shared by the clients.
pub struct KrbEnvironment {
    pub kdc: KdcMock,
    pub service_key: Vec<u8>,
    pub cache: Arc<TicketCache>,
}

pub fn init_krb_environment() -> KrbEnvironment {
    init_logging();

    let service_key = random_key();
    let kdc = KdcMock::new(REALM)
        .with_user(USERNAME, PASSWORD, &format!("{}{}", REALM, USERNAME))
        .with_service(TARGET_NAME, service_key.clone());

    KrbEnvironment {
        kdc,
        service_key,
        cache: Arc::new(TicketCache::new()),
    }
}

impl KrbEnvironment {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(DOMAIN, USERNAME, PASSWORD)
    }

    pub fn client(&self, requirements: ClientRequestFlags) -> KerberosClient {
        self.client_with_config(KerberosConfig::default(), requirements)
    }

    pub fn client_with_config(&self, config: KerberosConfig, requirements: ClientRequestFlags) -> KerberosClient {
        KerberosClient::new(
            config,
            self.credentials(),
            TARGET_NAME,
            requirements,
            Box::new(self.kdc.clone()),
            Arc::clone(&self.cache),
        )
    }

    pub fn acceptor(&self) -> MockAcceptor {
        MockAcceptor::new(self.service_key.clone())
    }
}
