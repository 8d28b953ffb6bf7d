#[macro_use]
extern crate tracing;

pub mod config;
pub mod listener;
pub mod mitm;
pub mod outbound;
pub mod router;
pub mod session;
pub mod tls;

use std::sync::Arc;

use proxy_mitm::CertificateStore;

use crate::config::Config;
use crate::router::Router;

/// Shared state handed to every listener and session.
#[derive(Clone)]
pub struct EngineState {
    pub conf: Arc<Config>,
    pub router: Arc<Router>,
    pub cert_store: Option<Arc<CertificateStore>>,
}

impl EngineState {
    pub fn new(conf: Config) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let cert_store = match &conf.mitm {
            Some(mitm_conf) => {
                let store = CertificateStore::from_pkcs12(&mitm_conf.base64_p12, &mitm_conf.passphrase)
                    .context("failed to load the interception CA bundle")?;
                store.set_hostnames(mitm_conf.hostnames.iter().cloned());
                Some(Arc::new(store))
            }
            None => None,
        };

        let router = Arc::new(Router::new(&conf)?);

        Ok(Self {
            conf: Arc::new(conf),
            router,
            cert_store,
        })
    }
}
