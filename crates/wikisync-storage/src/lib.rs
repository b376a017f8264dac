//! Remote call execution, rate budgeting and durable local state (snapshots, checkpoints).

use std::path::Path;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod checkpoint;
pub mod executor;
pub mod http;
pub mod snapshot;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointLoad, CheckpointStore, DetailProgress, MergeInput,
    Phase, PhaseState, SavingProgress, ScanProgress, CHECKPOINT_SCHEMA_VERSION,
};
pub use executor::{
    ErrorContext, ExecutorError, RetryExecutor, RetryPolicy, RunError, RunErrorLog,
    ThroughputWindow,
};
pub use http::{GraphqlClient, GraphqlClientConfig, RateBudget, RateBudgetConfig};
pub use snapshot::{LoadedSnapshot, SnapshotStore, WrittenSnapshot};

pub const CRATE_NAME: &str = "wikisync-storage";

/// How a failed remote call should be treated by the retry executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Transient,
    Fatal,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("rate limited by remote (http {status})")]
    RateLimited { status: u16 },
    #[error("authorization rejected (http {status}) for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("graphql error: {0}")]
    Graphql(String),
    #[error("unexpected response shape: {0}")]
    Decode(String),
    #[error("client is shut down")]
    Closed,
}

impl RemoteError {
    pub fn from_status(status: StatusCode, url: impl Into<String>) -> Self {
        let url = url.into();
        if status == StatusCode::TOO_MANY_REQUESTS {
            RemoteError::RateLimited {
                status: status.as_u16(),
            }
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            RemoteError::Unauthorized {
                status: status.as_u16(),
                url,
            }
        } else {
            RemoteError::HttpStatus {
                status: status.as_u16(),
                url,
            }
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::RateLimited { .. } => ErrorClass::RateLimited,
            RemoteError::Unauthorized { .. } | RemoteError::Decode(_) | RemoteError::Closed => {
                ErrorClass::Fatal
            }
            RemoteError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(ErrorClass::Fatal),
            RemoteError::Request(err) => classify_reqwest_error(err),
            RemoteError::Graphql(message) => {
                if message.to_ascii_lowercase().contains("rate limit") {
                    ErrorClass::RateLimited
                } else {
                    ErrorClass::Fatal
                }
            }
        }
    }
}

pub fn classify_status(status: StatusCode) -> ErrorClass {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorClass {
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes through a uniquely named temp file in the same directory, then rename.
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<Vec<u8>> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_bytes_atomic(path, &bytes).await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn status_classification_separates_rate_limits_and_auth() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ErrorClass::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            ErrorClass::Transient
        );
        assert_eq!(
            RemoteError::from_status(StatusCode::UNAUTHORIZED, "http://api").class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            RemoteError::from_status(StatusCode::SERVICE_UNAVAILABLE, "http://api").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            RemoteError::Graphql("Rate limit exceeded for token".into()).class(),
            ErrorClass::RateLimited
        );
        assert_eq!(
            RemoteError::Graphql("Cannot query field \"foo\"".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[tokio::test]
    async fn atomic_json_write_replaces_previous_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        write_json_atomic(&path, &serde_json::json!({"v": 1}))
            .await
            .expect("first write");
        write_json_atomic(&path, &serde_json::json!({"v": 2}))
            .await
            .expect("second write");

        let text = std::fs::read_to_string(&path).expect("read back");
        let value: serde_json::Value = serde_json::from_str(&text).expect("parse");
        assert_eq!(value["v"], 2);
        let leftovers = std::fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
