//! Failure taxonomy shared by the workers, the dispatcher and the gateways.
use thiserror::Error;

/// Broker connection or subscription failure. Fatal to the worker that hit it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
    #[error("broker connection failed: {0}")]
    Connect(#[source] rumqttc::ConnectionError),
    #[error("broker rejected connection: {0:?}")]
    Rejected(rumqttc::ConnectReturnCode),
    #[error("subscribe to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
    #[error("broker refused subscription to {0}")]
    SubscriptionRejected(String),
    #[error("broker event loop failed: {0}")]
    Receive(#[source] rumqttc::ConnectionError),
    #[error("gave up reconnecting after {0} attempts")]
    RetriesExhausted(u32),
}

/// Payload bytes are not UTF-8 text.
#[derive(Debug, Error)]
#[error("payload is not valid UTF-8: {0}")]
pub struct DecodeError(#[from] pub std::str::Utf8Error);

/// Text is not a well-formed document, or a mandatory field is missing.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("missing mandatory field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid store response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("record could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid column name `{0}`")]
    InvalidColumn(String),
    #[error("invalid store url: {0}")]
    InvalidUrl(String),
}

/// One reminder row that could not be read. Skipped; the rest of the tick goes on.
#[derive(Debug, Clone, Error)]
#[error("unusable reminder row {reminder_id}: {reason}")]
pub struct InvalidReminder {
    pub reminder_id: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("invalid address `{address}`: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("mail relay error: {0}")]
    Relay(#[from] lettre::transport::smtp::Error),
}

/// Everything that can go wrong while handling one inbound message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
