pub mod config;
pub mod error;
pub mod kms;
pub mod rpc;
pub mod server;
pub mod supervisor;
pub mod tls;
