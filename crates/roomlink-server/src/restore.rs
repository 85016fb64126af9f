//! Rebuilding the session registry after the process was suspended.
//!
//! The host keeps transports open across a suspend but the in-memory
//! registry is lost. Restoring enumerates the surviving handles, reloads
//! each attachment and rebuilds the registry from scratch.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use roomlink_core::{ConnectionId, SessionHost};

use crate::{registry::SessionRegistry, room::Room};

/// One connection that could not be restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreFailure {
    pub conn_id: ConnectionId,
    pub error: String,
}

/// Outcome of one restore pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Sessions now registered.
    pub restored: usize,
    /// Handles skipped because their attachment was missing or unreadable.
    pub failures: Vec<RestoreFailure>,
}

impl Room {
    /// Rebuild the registry from the host's open handles.
    ///
    /// Must run before the room processes any message after a resume.
    /// One bad attachment never aborts the pass; failures are collected
    /// and handed to the restore-error hook in one call.
    pub async fn restore(&self, host: &dyn SessionHost) -> RestoreReport {
        let handles = host.open_connections().await;
        let mut rebuilt = SessionRegistry::new();
        let mut failures = Vec::new();

        for conn in handles {
            let conn_id = conn.id();
            let loaded = match self.inner.store.load(conn_id).await {
                Ok(Some(attachment)) => attachment.to_meta().map_err(|e| e.to_string()),
                Ok(None) => Err("missing attachment".to_string()),
                Err(e) => Err(e.to_string()),
            };
            match loaded {
                Ok(meta) => {
                    rebuilt.register(conn, meta);
                }
                Err(error) => {
                    tracing::warn!(conn_id = %conn_id, error = %error, "Failed to restore session");
                    failures.push(RestoreFailure { conn_id, error });
                }
            }
        }

        let restored = rebuilt.len();
        self.registry().replace(rebuilt);
        tracing::info!(
            room = %self.name(),
            restored,
            failed = failures.len(),
            "Session registry restored"
        );

        let definition = &self.inner.definition;
        if restored > 0 {
            if let Some(hook) = &definition.on_restore {
                match AssertUnwindSafe(hook(restored)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "Restore hook failed"),
                    Err(_) => tracing::error!("Restore hook panicked"),
                }
            }
        }
        if !failures.is_empty() {
            if let Some(hook) = &definition.on_restore_error {
                if AssertUnwindSafe(hook(failures.clone()))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    tracing::error!("Restore error hook panicked");
                }
            }
        }

        RestoreReport { restored, failures }
    }
}
