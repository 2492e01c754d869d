// Single-writer, single-reader hand-off of new certificate bundles
//
// A publish only completes once the reader has applied the bundle, so the
// writer knows the new certificate is live before it moves on.

use std::{sync::Arc, time::Duration};

use log::debug;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};

use crate::error::HandoffError;

use super::bundle::CertificateBundle;

/// A bundle in transit, acknowledged once applied
#[derive(Debug)]
pub struct Handoff {
    bundle: CertificateBundle,
    applied: oneshot::Sender<()>,
}

impl Handoff {
    pub fn bundle(&self) -> &CertificateBundle {
        &self.bundle
    }

    /// Take the bundle and tell the publisher it is now active
    ///
    /// Call only after the bundle is visible to readers.
    pub fn complete<F: FnOnce(CertificateBundle)>(self, apply: F) {
        apply(self.bundle);
        let _ = self.applied.send(());
    }
}

/// Create a connected publisher and receiver pair
pub fn channel() -> (BundlePublisher, BundleReceiver) {
    let (tx, rx) = mpsc::channel(1);

    (
        BundlePublisher { tx },
        BundleReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

#[derive(Debug, Clone)]
pub struct BundlePublisher {
    tx: mpsc::Sender<Handoff>,
}

impl BundlePublisher {
    /// Hand `bundle` to the reader and wait until it has been applied
    ///
    /// Fails with `Timeout` if nothing applies it within `grace`, and with
    /// `ReaderGone` once the receiver has been dropped.
    pub async fn publish(&self, bundle: CertificateBundle, grace: Duration) -> Result<(), HandoffError> {
        let (applied, ack) = oneshot::channel();

        let delivery = async {
            self.tx
                .send(Handoff { bundle, applied })
                .await
                .map_err(|_| HandoffError::ReaderGone)?;

            ack.await.map_err(|_| HandoffError::ReaderGone)
        };

        tokio::time::timeout(grace, delivery)
            .await
            .map_err(|_| HandoffError::Timeout(grace))??;

        debug!("Certificate hand-off acknowledged");
        Ok(())
    }
}

/// Receiving end, shared so a restarted reader can pick it up again
#[derive(Debug, Clone)]
pub struct BundleReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Handoff>>>,
}

impl BundleReceiver {
    /// Take exclusive use of the receiver until the subscription is dropped
    pub async fn subscribe(&self) -> Subscription {
        Subscription {
            rx: Arc::clone(&self.rx).lock_owned().await,
        }
    }
}

pub struct Subscription {
    rx: OwnedMutexGuard<mpsc::Receiver<Handoff>>,
}

impl Subscription {
    /// The next published bundle, `None` once every publisher is gone
    pub async fn next(&mut self) -> Option<Handoff> {
        self.rx.recv().await
    }
}
