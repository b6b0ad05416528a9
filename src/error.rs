use thiserror::Error;

use crate::engine::state::Stage;

/// Failures surfaced by the update flow and the device API.
///
/// Every variant is terminal for the operation that produced it; nothing in
/// the console retries on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("release feed error: {0}")]
    FeedFetch(String),

    #[error("No {0} file found")]
    MissingAsset(String),

    #[error("{0}")]
    TransferTransport(String),

    #[error("{0}")]
    TransferRejected(String),

    #[error("malformed version {version:?}: segment {segment:?} is not a number")]
    MalformedVersion { version: String, segment: String },

    #[error("a {0} transfer is already in progress")]
    TransferInProgress(Stage),

    #[error("failed to download {asset}: {reason}")]
    AssetDownload { asset: String, reason: String },

    #[error("checksum mismatch for {asset}: expected {expected}, got {actual}")]
    DigestMismatch {
        asset: String,
        expected: String,
        actual: String,
    },

    #[error("device request failed: {0}")]
    Device(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, OtaError>;
