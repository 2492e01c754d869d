use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, builder::BoolishValueParser};
use kmsproxy::{
    config::{Config, LogLevel},
    kms::HttpKeyManagement,
    server::{ListenerSettings, RpcListener},
    supervisor::Supervisor,
    tls::{
        self, AgentSettings, CertificateAgent, CertificateConsumer, CertificateDistributor, CertificateStore,
        acme::AcmeAuthority, challenge::WebhookChallengeProvider, handoff,
    },
};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::error::CliError;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Optional TOML configuration file, flags override its values
    #[arg(short, long, env = "KMSPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Domain to certify, repeat or comma-separate for more (the first one is primary)
    #[arg(short, long = "domain", env = "DOMAINS", value_delimiter = ',')]
    domains: Vec<String>,

    /// Contact email for the ACME account
    #[arg(long, env = "EMAIL")]
    email: Option<String>,

    /// Directory holding the account and certificate state
    #[arg(long, env = "WORKDIR")]
    workdir: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "LISTEN")]
    listen: Option<SocketAddr>,

    /// Port to listen on, replaces the port of `--listen`
    #[arg(short, long, env = "LISTEN_PORT")]
    port: Option<u16>,

    /// Use the Let's Encrypt staging environment
    #[arg(
        long,
        env = "DEBUG_MODE",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    staging: Option<bool>,

    /// ACME directory URL, overrides `--staging`
    #[arg(long, env = "ACME_DIRECTORY_URL")]
    directory_url: Option<String>,

    /// The log level for the application
    #[arg(short, long, env = "LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Base URL of the key management service
    #[arg(long, env = "KMS_ENDPOINT")]
    kms_endpoint: Option<String>,

    /// Key used for every seal and unseal
    #[arg(long, env = "KMS_KEY_ID")]
    kms_key_id: Option<String>,

    /// Endpoint that creates DNS TXT records
    #[arg(long, env = "CHALLENGE_CREATE_URL")]
    challenge_create_url: Option<String>,

    /// Endpoint that deletes DNS TXT records, `{record_id}` is substituted
    #[arg(long, env = "CHALLENGE_DELETE_URL")]
    challenge_delete_url: Option<String>,

    /// Extra `Name: value` header for challenge webhook requests
    #[arg(long = "challenge-header", env = "CHALLENGE_HEADERS", value_delimiter = ',')]
    challenge_headers: Vec<String>,

    /// Seconds to wait for TXT records to propagate
    #[arg(long, env = "CHALLENGE_PROPAGATION_SECS")]
    propagation_secs: Option<u64>,
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub async fn execute(self) -> Result<(), CliError> {
        let config = self.load_config();

        // NOTE: the command line level always wins over the configuration file
        let level = self
            .log_level
            .or_else(|| config.as_ref().ok().and_then(|c| c.log_level))
            .unwrap_or_default();
        env_logger::Builder::new()
            .filter_level(level.to_log_level_filter())
            .init();

        info!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

        let config = config?;
        debug!("Using configuration: {config:?}");

        run(config).await
    }

    /// Layer flags and environment over the file (or default) configuration
    fn load_config(&self) -> Result<Config, CliError> {
        let mut config = match &self.config {
            Some(path) => kmsproxy::config::toml::load(path)?,
            None => Config::default(),
        };

        if !self.domains.is_empty() {
            config.domains = self.domains.iter().map(|d| d.trim().to_string()).collect();
        }
        if let Some(email) = &self.email {
            config.email = email.clone();
        }
        if let Some(workdir) = &self.workdir {
            config.workdir = workdir.clone();
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(port) = self.port {
            config.listen.set_port(port);
        }
        if let Some(staging) = self.staging {
            config.staging = staging;
        }
        if let Some(url) = &self.directory_url {
            config.directory_url = Some(url.clone());
        }
        if let Some(level) = self.log_level {
            config.log_level = Some(level);
        }
        if let Some(endpoint) = &self.kms_endpoint {
            config.kms.endpoint = Some(endpoint.clone());
        }
        if let Some(key_id) = &self.kms_key_id {
            config.kms.key_id = key_id.clone();
        }
        if let Some(url) = &self.challenge_create_url {
            config.challenge.create_url = Some(url.clone());
        }
        if let Some(url) = &self.challenge_delete_url {
            config.challenge.delete_url = Some(url.clone());
        }
        for header in &self.challenge_headers {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| CliError::Header(header.clone()))?;
            config
                .challenge
                .headers
                .insert(name.trim().to_string(), value.trim().to_string());
        }
        if let Some(secs) = self.propagation_secs {
            config.challenge.propagation_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Wire the certificate agent and the RPC listener together and run them
async fn run(config: Config) -> Result<(), CliError> {
    tls::install_crypto_provider();
    create_workdir(&config.workdir)?;

    let store = CertificateStore::new(config.workdir.clone(), config.domains.clone());
    let challenge = Arc::new(WebhookChallengeProvider::from_config(&config.challenge)?);
    let directory = config.directory();
    info!("Using ACME directory {directory}");
    let authority = Arc::new(AcmeAuthority::new(directory, challenge));

    let (publisher, receiver) = handoff::channel();
    let agent = Arc::new(CertificateAgent::new(
        authority,
        store.clone(),
        publisher,
        AgentSettings::from_config(&config),
    ));

    let distributor = Arc::new(CertificateDistributor::new());
    let consumer = Arc::new(CertificateConsumer::new(Arc::clone(&distributor), receiver));

    let kms = Arc::new(HttpKeyManagement::from_config(&config.kms)?);
    let listener = Arc::new(RpcListener::new(
        ListenerSettings::from_config(&config),
        distributor,
        store,
        kms,
    ));

    let mut supervisor = Supervisor::new();
    supervisor.add(agent).add(consumer).add(listener);

    let token = CancellationToken::new();
    watch_for_shutdown(token.clone());

    supervisor.run(token).await?;
    info!("Shut down cleanly");

    Ok(())
}

/// Create the working directory, owner-only on Unix
fn create_workdir(path: &Path) -> Result<(), CliError> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }

    builder.create(path).map_err(|source| CliError::Workdir {
        path: path.display().to_string(),
        source,
    })
}

/// Cancel `token` on Ctrl+C, or SIGTERM on Unix
fn watch_for_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    log::error!("Failed to install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        info!("Received shutdown signal, shutting down...");
        token.cancel();
    });
}
