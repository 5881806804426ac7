use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("MQTT connection error: {0}")]
    Connection(String),

    #[error("Malformed sensor payload: {0}")]
    Parse(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl From<rumqttc::ClientError> for BridgeError {
    fn from(e: rumqttc::ClientError) -> Self {
        BridgeError::Connection(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
