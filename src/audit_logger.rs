//! Structured audit logging for control-plane events.
//!
//! Events are serialised to JSON and written asynchronously via an unbounded
//! channel so the apply path never blocks on log I/O. The logger task drains
//! the channel and writes each event to the configured output (file or stderr).

use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::config::LoggingConfig;

/// Control-plane audit events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Proxy engine accepted a document
    ConfigApplied { hash: String, routes: usize },
    /// Proxy engine rejected a document or timed out
    ConfigApplyFailed { hash: String, error: String },
    /// Document hash equals the last applied one; engine not called
    ApplySkipped { hash: String },
    /// A mutation was reversed after its apply failed
    MutationRolledBack { mutation: String, apply_error: String },
    /// Reversal failed; declared and live state now disagree
    RollbackFailed {
        mutation: String,
        apply_error: String,
        reason: String,
    },
    /// An entity was destroyed
    EntityDeleted { entity: String, id: String },
    /// Declared state written to a backup file
    BackupWritten { path: String, reason: String },
    /// Admin API action
    AdminAction {
        ip: String,
        action: String,
        success: bool,
        detail: Option<String>,
    },
    /// Admin API authentication failure
    AuthFailure { ip: String, reason: String },
}

/// Wrapper with metadata added at emission time
#[derive(Serialize)]
struct AuditRecord {
    timestamp: String,
    level: &'static str,
    category: &'static str,
    #[serde(flatten)]
    event: AuditEvent,
}

impl AuditEvent {
    fn level(&self) -> &'static str {
        match self {
            Self::RollbackFailed { .. } => "ERROR",
            Self::ConfigApplyFailed { .. }
            | Self::MutationRolledBack { .. }
            | Self::AuthFailure { .. }
            | Self::AdminAction { success: false, .. } => "WARN",
            _ => "INFO",
        }
    }

    fn category(&self) -> &'static str {
        match self {
            Self::ConfigApplied { .. }
            | Self::ConfigApplyFailed { .. }
            | Self::ApplySkipped { .. } => "apply",
            Self::MutationRolledBack { .. } | Self::RollbackFailed { .. } => "rollback",
            Self::EntityDeleted { .. } => "entity",
            Self::BackupWritten { .. } => "backup",
            Self::AdminAction { .. } => "admin",
            Self::AuthFailure { .. } => "auth",
        }
    }
}

/// Async audit logger
pub struct AuditLogger {
    tx: mpsc::UnboundedSender<AuditEvent>,
    /// Background writer task (kept alive as long as the logger is alive)
    _task: Option<Arc<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Create an audit logger writing to the path in `logging_config`, or stderr if None.
    /// Must be called inside a tokio runtime.
    pub fn new(logging_config: &LoggingConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();

        let path = logging_config.audit_log_path.clone();
        let enabled = logging_config.audit_log_enabled;

        let task = tokio::spawn(async move {
            if !enabled {
                // Drain without writing
                while rx.recv().await.is_some() {}
                return;
            }

            while let Some(event) = rx.recv().await {
                let record = AuditRecord {
                    timestamp: Utc::now().to_rfc3339(),
                    level: event.level(),
                    category: event.category(),
                    event,
                };

                match serde_json::to_string(&record) {
                    Ok(mut line) => {
                        line.push('\n');
                        if let Some(ref p) = path {
                            match OpenOptions::new().create(true).append(true).open(p) {
                                Ok(mut f) => {
                                    if let Err(e) = f.write_all(line.as_bytes()) {
                                        error!("audit_logger: write error: {}", e);
                                    }
                                }
                                Err(e) => {
                                    error!("audit_logger: open {:?} error: {}", p, e);
                                    eprint!("{}", line);
                                }
                            }
                        } else {
                            eprint!("{}", line);
                        }
                    }
                    Err(e) => warn!("audit_logger: serialisation error: {}", e),
                }
            }
        });

        Self {
            tx,
            _task: Some(Arc::new(task)),
        }
    }

    /// Logger that discards every event. Usable outside a runtime.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx, _task: None }
    }

    /// Logger whose events are handed to the caller instead of written out
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, _task: None }, rx)
    }

    /// Submit an audit event (non-blocking).
    pub fn log(&self, event: AuditEvent) {
        // If receiver is gone (shutdown), silently drop
        let _ = self.tx.send(event);
    }

    /// Convenience: log an admin action.
    pub fn log_admin_action(
        &self,
        ip: IpAddr,
        action: impl Into<String>,
        success: bool,
        detail: Option<String>,
    ) {
        self.log(AuditEvent::AdminAction {
            ip: ip.to_string(),
            action: action.into(),
            success,
            detail,
        });
    }

    /// Convenience: log an admin authentication failure.
    pub fn log_auth_failure(&self, ip: IpAddr, reason: impl Into<String>) {
        self.log(AuditEvent::AuthFailure {
            ip: ip.to_string(),
            reason: reason.into(),
        });
    }
}
