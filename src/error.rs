use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Directory resolution failed: {0}")]
    Directory(String),

    #[error("Backlink index error: {0}")]
    Backlinks(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Seal verification failed: {0}")]
    VerificationFailure(String),

    #[error("Integrity violation (stolen: {stolen}): {reason}")]
    IntegrityViolation { stolen: bool, reason: String },

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ExchangeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExchangeError::NotFound(_))
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Serialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for ExchangeError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ExchangeError::Crypto(err.to_string())
    }
}

impl From<base64::DecodeError> for ExchangeError {
    fn from(err: base64::DecodeError) -> Self {
        ExchangeError::Crypto(err.to_string())
    }
}

impl From<hex::FromHexError> for ExchangeError {
    fn from(err: hex::FromHexError) -> Self {
        ExchangeError::Config(err.to_string())
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(err: std::io::Error) -> Self {
        ExchangeError::Io(err.to_string())
    }
}
