// Certificate lifecycle: persistence, issuance, renewal and hot reload

pub mod acme;
pub mod agent;
pub mod authority;
pub mod bundle;
pub mod challenge;
pub mod distributor;
pub mod handoff;
pub mod schedule;
pub mod store;

pub use agent::{AgentSettings, AgentState, CertificateAgent};
pub use authority::{CertificateAuthority, IssuedCertificate, Registration, RenewalWindow};
pub use bundle::{AccountState, CertificateBundle, LeafInfo};
pub use distributor::{CertificateConsumer, CertificateDistributor, build_tls_acceptor};
pub use challenge::PublishedRecords;
pub use handoff::{BundlePublisher, BundleReceiver};
pub use schedule::{FALLBACK_INTERVAL, RenewalSchedule};
pub use store::CertificateStore;

/// Install aws-lc-rs as the process-wide rustls provider
///
/// Other dependencies enable a second provider, which leaves rustls without a
/// default unless one is installed explicitly. Safe to call more than once.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
