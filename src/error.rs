use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("serialization error: {0}")]
    Serialize(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("missing required option `{0}`")]
    MissingOption(&'static str),
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),
    #[error("unknown plugin `{0}`")]
    UnknownPlugin(String),
    #[error("plugin `{0}` has no {1} capability")]
    MissingCapability(String, &'static str),
    #[error("unknown processor `{0}`")]
    UnknownProcessor(String),
    #[error("subscriber error: {0}")]
    Subscriber(String),
    #[error("retries timed out after {elapsed:?}")]
    RetryTimeout {
        elapsed: std::time::Duration,
        #[source]
        last: Box<Error>,
    },
}
