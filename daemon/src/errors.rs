//! Domain error types, one per external collaborator plus the store and the
//! receipt parser, composed by callers with `anyhow::Context` the way
//! `taker_cfd_actor.rs`/`lib.rs` do upstream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformDError {
    #[error("platform-d transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("platform-d session expired")]
    SessionExpired,
    #[error("platform-d returned an unexpected payload: {0}")]
    UnexpectedPayload(String),
}

#[derive(Debug, Error)]
pub enum PlatformXError {
    #[error("platform-x transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("platform-x signature expired or clock skew detected")]
    ClockSkew,
    #[error("platform-x rate limited (retCode {0})")]
    RateLimited(i64),
    #[error("platform-x retCode {code}: {msg}")]
    Api { code: i64, msg: String },
}

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("attachment {0} not found")]
    AttachmentNotFound(String),
}

#[derive(Debug, Error)]
pub enum ReceiptParseError {
    #[error("missing required field(s): {0:?}")]
    MissingFields(Vec<&'static str>),
    #[error("unrecognized receipt template")]
    UnrecognizedTemplate,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("record not found")]
    NotFound,
}
