#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no active audio session")]
    NotConnected,

    #[error("no results for '{0}'")]
    NoResults(String),

    #[error("audio backend error: {0}")]
    Backend(String),

    #[error("external source timed out")]
    SourceTimeout,

    #[error("external source error: {0}")]
    Source(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
