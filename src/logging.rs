//! Logging and audit trail functionality
//!
//! Every lifecycle event is mirrored into `tracing`. With the `logging`
//! feature an [`AuditLog`] can additionally append events as JSON lines to a
//! size-rotated file. Audit failures are logged and swallowed; they never
//! fail the operation that produced the event.

use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

#[cfg(feature = "logging")]
use {
    std::path::PathBuf,
    std::sync::atomic::{AtomicU64, Ordering},
    std::sync::Arc,
    time::OffsetDateTime,
    tokio::io::AsyncWriteExt,
    tokio::sync::Mutex,
};

/// Types of events that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Token lifecycle event
    #[serde(rename = "token")]
    Token {
        /// Type of token operation
        operation: TokenOperation,
        /// Fingerprint of the token value
        fingerprint: String,
        /// ID of the client
        client_id: String,
        /// Subject of the token
        identity: String,
    },

    /// A commit was rejected by the store
    #[serde(rename = "conflict")]
    Conflict {
        /// ID of the client
        client_id: String,
        /// What went wrong
        details: String,
    },
}

/// Types of token operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TokenOperation {
    /// A new token was created
    #[serde(rename = "issued")]
    Issued,
    /// An outstanding token was handed out again
    #[serde(rename = "reused")]
    Reused,
    /// Token was revoked
    #[serde(rename = "revoked")]
    Revoked,
    /// Token usage was recorded for the day
    #[serde(rename = "touched")]
    Touched,
}

/// Install a `tracing` subscriber for applications embedding the library
///
/// `RUST_LOG` takes precedence over `default_filter`.
///
/// # Errors
///
/// Returns [`Error::Config`] if the filter does not parse or a global
/// subscriber is already installed.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| Error::Config(format!("Invalid log filter: {e}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install subscriber: {e}")))
}

/// Fan-out point the lifecycle services report events to
#[derive(Debug, Clone, Default)]
pub(crate) struct Auditor {
    #[cfg(feature = "logging")]
    sink: Option<Arc<AuditLog>>,
}

impl Auditor {
    #[cfg(feature = "logging")]
    pub(crate) const fn with_sink(sink: Arc<AuditLog>) -> Self {
        Self { sink: Some(sink) }
    }

    pub(crate) async fn emit(&self, event: Event) {
        match &event {
            Event::Token {
                operation,
                fingerprint,
                client_id,
                identity,
            } => {
                info!(
                    operation = ?operation,
                    token = %fingerprint,
                    client_id = %client_id,
                    identity = %identity,
                    "Token event"
                );
            }
            Event::Conflict { client_id, details } => {
                warn!(client_id = %client_id, details = %details, "Commit conflict");
            }
        }

        #[cfg(feature = "logging")]
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record(&event).await {
                warn!(error = %e, "Failed to write audit event");
            }
        }
    }
}

/// Configuration for the audit log
#[cfg(feature = "logging")]
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Path to the log file
    pub path: PathBuf,
    /// Maximum size of log file before rotation (in bytes)
    pub max_size: u64,
    /// Number of rotated files to keep
    pub keep_files: usize,
}

#[cfg(feature = "logging")]
impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("audit.log"),
            max_size: 10 * 1024 * 1024,
            keep_files: 5,
        }
    }
}

/// Append-only JSON lines audit file with size-based rotation
#[cfg(feature = "logging")]
#[derive(Debug)]
pub struct AuditLog {
    config: LogConfig,
    current_size: AtomicU64,
    write: Mutex<()>,
}

#[cfg(feature = "logging")]
impl AuditLog {
    /// Open (or start) the audit log described by `config`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the log directory cannot be created.
    pub fn new(config: LogConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let current_size = std::fs::metadata(&config.path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(Self {
            config,
            current_size: AtomicU64::new(current_size),
            write: Mutex::new(()),
        })
    }

    /// Append one event
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized or written.
    pub async fn record(&self, event: &Event) -> Result<()> {
        let entry = serde_json::json!({
            "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
            "event": event,
        });
        let log_line = format!("{}\n", serde_json::to_string(&entry)?);
        let line_len = u64::try_from(log_line.len()).unwrap_or(u64::MAX);

        let _guard = self.write.lock().await;

        let current = self.current_size.load(Ordering::Relaxed);
        if current > 0 && current.saturating_add(line_len) > self.config.max_size {
            self.rotate().await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .await?;
        file.write_all(log_line.as_bytes()).await?;
        // write_all returns before the blocking write lands
        file.flush().await?;

        self.current_size.fetch_add(line_len, Ordering::Relaxed);
        Ok(())
    }

    /// Shift `audit.log.N` files up by one and move the live file to `.1`
    async fn rotate(&self) -> Result<()> {
        for i in (1..=self.config.keep_files).rev() {
            let old_path = self.rotated_path(i);
            if tokio::fs::try_exists(&old_path).await? {
                if i == self.config.keep_files {
                    tokio::fs::remove_file(&old_path).await?;
                } else {
                    tokio::fs::rename(&old_path, self.rotated_path(i.saturating_add(1))).await?;
                }
            }
        }

        if tokio::fs::try_exists(&self.config.path).await? {
            if self.config.keep_files == 0 {
                tokio::fs::remove_file(&self.config.path).await?;
            } else {
                tokio::fs::rename(&self.config.path, self.rotated_path(1)).await?;
            }
        }

        self.current_size.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn rotated_path(&self, n: usize) -> PathBuf {
        let mut name = self.config.path.as_os_str().to_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }
}
