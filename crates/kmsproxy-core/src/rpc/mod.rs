// Seal/unseal RPC surface backed by the key management client

pub mod proto {
    tonic::include_proto!("kms");
}

use std::sync::Arc;

use log::{info, warn};
use tonic::{Request, Response, Status};

use crate::kms::KeyManagement;

pub use proto::kms_service_server::{KmsService, KmsServiceServer};

/// `kms.KMSService` over a [`KeyManagement`] backend
#[derive(Clone)]
pub struct KmsRpc {
    kms: Arc<dyn KeyManagement>,
}

impl KmsRpc {
    pub fn new(kms: Arc<dyn KeyManagement>) -> Self {
        Self { kms }
    }

    pub fn into_server(self) -> KmsServiceServer<Self> {
        KmsServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl KmsService for KmsRpc {
    async fn seal(&self, request: Request<proto::Request>) -> Result<Response<proto::Response>, Status> {
        let request = request.into_inner();
        info!("Seal request from node {}", request.node_uuid);

        let data = self
            .kms
            .encrypt(&request.node_uuid, &request.data)
            .await
            .map_err(|e| {
                warn!("Seal for node {} failed: {e}", request.node_uuid);
                Status::from(e)
            })?;

        Ok(Response::new(proto::Response { data }))
    }

    async fn unseal(&self, request: Request<proto::Request>) -> Result<Response<proto::Response>, Status> {
        let request = request.into_inner();
        info!("Unseal request from node {}", request.node_uuid);

        let data = self
            .kms
            .decrypt(&request.node_uuid, &request.data)
            .await
            .map_err(|e| {
                warn!("Unseal for node {} failed: {e}", request.node_uuid);
                Status::from(e)
            })?;

        Ok(Response::new(proto::Response { data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KmsError;
    use async_trait::async_trait;

    /// Reverses bytes on encrypt and decrypt, fails for node "broken"
    struct ReversingKms;

    #[async_trait]
    impl KeyManagement for ReversingKms {
        async fn encrypt(&self, node: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
            if node == "broken" {
                return Err(KmsError::Api {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(plaintext.iter().rev().copied().collect())
        }

        async fn decrypt(&self, node: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
            self.encrypt(node, ciphertext).await
        }

        async fn check_key(&self) -> Result<(), KmsError> {
            Ok(())
        }
    }

    fn request(node: &str, data: &[u8]) -> Request<proto::Request> {
        Request::new(proto::Request {
            node_uuid: node.to_string(),
            data: data.to_vec(),
        })
    }

    #[tokio::test]
    async fn test_seal_forwards_bytes() {
        let rpc = KmsRpc::new(Arc::new(ReversingKms));

        let sealed = rpc.seal(request("node-1", b"abc")).await.unwrap().into_inner();
        assert_eq!(sealed.data, b"cba");

        let unsealed = rpc.unseal(request("node-1", &sealed.data)).await.unwrap().into_inner();
        assert_eq!(unsealed.data, b"abc");
    }

    #[tokio::test]
    async fn test_backend_failure_is_internal() {
        let rpc = KmsRpc::new(Arc::new(ReversingKms));

        let status = rpc.seal(request("broken", b"abc")).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);

        // Only that call fails
        assert!(rpc.seal(request("node-2", b"abc")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        use tonic::codegen::{Service, empty_body, http};

        let mut server = KmsRpc::new(Arc::new(ReversingKms)).into_server();
        let request = http::Request::builder()
            .uri("/kms.KMSService/Rotate")
            .body(empty_body())
            .unwrap();

        let response = server.call(request).await.unwrap();
        assert_eq!(response.headers()["grpc-status"], "12");
    }

    #[test]
    fn test_service_name_follows_proto_package() {
        use tonic::server::NamedService;

        assert_eq!(<KmsServiceServer<KmsRpc> as NamedService>::NAME, "kms.KMSService");
    }
}
