// TLS-terminating listener in front of the seal/unseal RPC service

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::stream;
use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_rustls::{TlsAcceptor, server::TlsStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::{
    config::Config,
    error::ServerError,
    kms::KeyManagement,
    rpc::KmsRpc,
    tls::{CertificateDistributor, CertificateStore, build_tls_acceptor},
};

/// Established TLS connections waiting to be picked up by the RPC server
const PENDING_CONNECTIONS: usize = 64;

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub listen: SocketAddr,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
}

impl ListenerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            listen: config.listen,
            handshake_timeout: config.timeouts.handshake(),
            drain_timeout: config.timeouts.drain(),
        }
    }
}

/// Accepts TCP, terminates TLS with the distributor's certificate and serves RPCs
///
/// Only reads the distributor; new certificates reach it through a separately
/// supervised [`CertificateConsumer`](crate::tls::CertificateConsumer).
pub struct RpcListener {
    settings: ListenerSettings,
    distributor: Arc<CertificateDistributor>,
    store: CertificateStore,
    kms: Arc<dyn KeyManagement>,
    acceptor: TlsAcceptor,
}

impl RpcListener {
    pub fn new(
        settings: ListenerSettings,
        distributor: Arc<CertificateDistributor>,
        store: CertificateStore,
        kms: Arc<dyn KeyManagement>,
    ) -> Self {
        let acceptor = build_tls_acceptor(Arc::clone(&distributor));

        Self {
            settings,
            distributor,
            store,
            kms,
            acceptor,
        }
    }

    pub fn distributor(&self) -> &Arc<CertificateDistributor> {
        &self.distributor
    }

    /// Check the key, load the persisted certificate, bind and serve until cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<(), ServerError> {
        self.kms.check_key().await?;
        debug!("Key management service is reachable");

        self.distributor.preload(&self.store)?;

        let listener = self.bind().await?;
        self.serve(listener, token).await
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let address = self.settings.listen;

        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::FailedToBind {
                address: address.to_string(),
                source,
            })?;
        info!("Listening on {address}");

        Ok(listener)
    }

    /// Serve RPCs on an already bound listener
    pub async fn serve(&self, listener: TcpListener, token: CancellationToken) -> Result<(), ServerError> {
        let (connections, pending) = mpsc::channel::<TlsStream<TcpStream>>(PENDING_CONNECTIONS);
        let incoming = Box::pin(stream::unfold(pending, |mut pending| async move {
            let connection = pending.recv().await?;
            Some((Ok::<_, std::io::Error>(connection), pending))
        }));

        let shutdown = token.clone();
        let server = Server::builder()
            .add_service(KmsRpc::new(Arc::clone(&self.kms)).into_server())
            .serve_with_incoming_shutdown(incoming, async move { shutdown.cancelled().await });
        tokio::pin!(server);

        let accepting = self.accept_loop(listener, connections, &token);
        tokio::pin!(accepting);

        tokio::select! {
            served = &mut server => served.map_err(ServerError::from),
            accepted = &mut accepting => match accepted {
                Ok(()) => self.drain(server).await,
                Err(e) => Err(e),
            },
        }
    }

    async fn drain<F>(&self, server: F) -> Result<(), ServerError>
    where
        F: Future<Output = Result<(), tonic::transport::Error>>,
    {
        let window = self.settings.drain_timeout;
        debug!("Draining in-flight requests for up to {window:?}");

        match tokio::time::timeout(window, server).await {
            Ok(served) => served?,
            Err(_) => warn!("Requests still in flight after {window:?}, closing them"),
        }

        info!("Listener stopped");
        Ok(())
    }

    /// Accept until cancelled, handing each connection to its own handshake task
    async fn accept_loop(
        &self,
        listener: TcpListener,
        connections: mpsc::Sender<TlsStream<TcpStream>>,
        token: &CancellationToken,
    ) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    drop(listener);
                    debug!("Shutdown signal received, no longer accepting connections");
                    return Ok(());
                }

                connection = listener.accept() => {
                    let (stream, addr) = connection.map_err(ServerError::FailedToAcceptConnection)?;
                    debug!("Accepted connection from {addr}");
                    self.spawn_handshake(stream, addr, connections.clone());
                }
            }
        }
    }

    fn spawn_handshake(&self, stream: TcpStream, addr: SocketAddr, connections: mpsc::Sender<TlsStream<TcpStream>>) {
        let acceptor = self.acceptor.clone();
        let deadline = self.settings.handshake_timeout;

        tokio::spawn(async move {
            match tokio::time::timeout(deadline, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    if connections.send(tls).await.is_err() {
                        debug!("Server stopped before the connection from {addr} was served");
                    }
                }
                Ok(Err(e)) => warn!("TLS handshake with {addr} failed: {e}"),
                Err(_) => warn!("TLS handshake with {addr} timed out after {deadline:?}"),
            }
        });
    }
}
