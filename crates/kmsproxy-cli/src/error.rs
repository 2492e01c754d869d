use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum CliError {
    #[error("{0}")]
    Config(#[from] kmsproxy::error::ConfigError),

    #[error("Failed to set up the challenge provider: {0}")]
    Challenge(#[from] kmsproxy::error::ChallengeError),

    #[error("Failed to set up the key management client: {0}")]
    Kms(#[from] kmsproxy::error::KmsError),

    #[error("{0}")]
    Proxy(#[from] kmsproxy::error::Error),

    #[error("Failed to create the working directory `{path}`: {source}")]
    Workdir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid challenge header `{0}`, expected `Name: value`")]
    Header(String),
}
