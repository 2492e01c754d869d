// Holds the active certificate and resolves it for every TLS handshake

use std::{fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use log::{debug, info, warn};
use rustls::{
    ServerConfig,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::error::{DistributorError, StoreError};

use super::{bundle::CertificateBundle, handoff::BundleReceiver, store::CertificateStore};

/// Cache of exactly one certificate bundle
///
/// The consume loop is the only writer. Handshakes read the slot through a
/// single atomic load, so they see either the old or the new bundle whole.
#[derive(Default)]
pub struct CertificateDistributor {
    active: ArcSwapOption<CertificateBundle>,
}

impl fmt::Debug for CertificateDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateDistributor")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl CertificateDistributor {
    pub fn new() -> Self {
        Self {
            active: ArcSwapOption::empty(),
        }
    }

    /// Use the persisted bundle until the first hand-off arrives
    ///
    /// Does nothing once a bundle is active, a newer one may not be on disk yet.
    pub fn preload(&self, store: &CertificateStore) -> Result<bool, StoreError> {
        if self.is_ready() {
            return Ok(true);
        }

        match store.load_bundle()? {
            Some(bundle) => {
                info!("Serving persisted certificate for {:?}", bundle.domains);
                // Never overwrite a bundle published while we were reading the disk
                let empty: Option<Arc<CertificateBundle>> = None;
                let previous = self.active.compare_and_swap(&empty, Some(Arc::new(bundle)));
                if previous.is_some() {
                    debug!("A newer certificate arrived during preload, keeping it");
                }
                Ok(true)
            }
            None => {
                info!("No persisted certificate, handshakes fail until one is issued");
                Ok(false)
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.active.load().is_some()
    }

    /// The bundle currently being served
    pub fn active(&self) -> Option<Arc<CertificateBundle>> {
        self.active.load_full()
    }

    /// Replace the active bundle in one atomic swap
    pub fn apply(&self, bundle: CertificateBundle) {
        self.active.store(Some(Arc::new(bundle)));
    }

    /// Parse the active bundle for a handshake
    ///
    /// Parsed every time, the bundle may have changed since the last call.
    pub fn certificate_for(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, DistributorError> {
        let bundle = self.active.load_full().ok_or(DistributorError::NotReady)?;

        let certified = bundle.certified_key()?;
        debug!(
            "Resolved certificate for {:?} ({})",
            server_name.unwrap_or("<no sni>"),
            bundle.primary_domain().unwrap_or_default()
        );

        Ok(certified)
    }

    /// Apply every handed-off bundle until cancelled or the publisher is gone
    pub async fn run(&self, receiver: &BundleReceiver, token: CancellationToken) {
        let mut subscription = tokio::select! {
            _ = token.cancelled() => return,
            subscription = receiver.subscribe() => subscription,
        };

        loop {
            let handoff = tokio::select! {
                _ = token.cancelled() => {
                    debug!("Certificate consumer cancelled");
                    return;
                }
                handoff = subscription.next() => handoff,
            };

            let Some(handoff) = handoff else {
                debug!("Certificate publisher is gone, consumer exiting");
                return;
            };

            info!("Activating new certificate for {:?}", handoff.bundle().domains);
            handoff.complete(|bundle| self.apply(bundle));
        }
    }
}

/// Feeds handed-off bundles into the distributor as its own supervised unit
///
/// Independent of the RPC listener, a listener restart does not interrupt it.
pub struct CertificateConsumer {
    distributor: Arc<CertificateDistributor>,
    receiver: BundleReceiver,
}

impl CertificateConsumer {
    pub fn new(distributor: Arc<CertificateDistributor>, receiver: BundleReceiver) -> Self {
        Self { distributor, receiver }
    }

    pub async fn run(&self, token: CancellationToken) {
        self.distributor.run(&self.receiver, token).await
    }
}

/// Resolves the active certificate, leaving a failing handshake without one
#[derive(Debug, Clone)]
pub struct DistributorResolver {
    distributor: Arc<CertificateDistributor>,
}

impl DistributorResolver {
    pub fn new(distributor: Arc<CertificateDistributor>) -> Self {
        Self { distributor }
    }
}

impl ResolvesServerCert for DistributorResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        match self.distributor.certificate_for(client_hello.server_name()) {
            Ok(certified) => Some(certified),
            Err(e) => {
                warn!("Rejecting TLS handshake: {e}");
                None
            }
        }
    }
}

/// Build a TLS acceptor that asks the distributor for a certificate per handshake
pub fn build_tls_acceptor(distributor: Arc<CertificateDistributor>) -> TlsAcceptor {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(DistributorResolver::new(distributor)));
    config.alpn_protocols = vec![b"h2".to_vec()];

    TlsAcceptor::from(Arc::new(config))
}
