//! Human sign-off for payments the policy will not auto-approve.

use crate::error::{CommerceError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Resolves to `true` when a human approves.
    async fn request_approval(&self, action: &str, description: &str, metadata: &Value)
        -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub action: String,
    pub description: String,
    pub metadata: Value,
}

/// Bounds an [`ApprovalChannel`] with a timeout and a cancellation token.
/// Anything other than an explicit yes is a terminal error.
#[derive(Clone)]
pub struct ApprovalGate {
    channel: Arc<dyn ApprovalChannel>,
    timeout: Duration,
}

impl ApprovalGate {
    pub fn new(channel: Arc<dyn ApprovalChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn request(&self, request: &ApprovalRequest, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(
            action = %request.action,
            description = %request.description,
            timeout_secs = self.timeout.as_secs(),
            "Approval requested"
        );

        let wait = tokio::time::timeout(
            self.timeout,
            self.channel
                .request_approval(&request.action, &request.description, &request.metadata),
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(action = %request.action, "Approval cancelled");
                return Err(CommerceError::ApprovalCancelled {
                    action: request.action.clone(),
                });
            }
            outcome = wait => outcome,
        };

        match outcome {
            Ok(Ok(true)) => {
                tracing::info!(action = %request.action, "Approval granted");
                Ok(())
            }
            Ok(Ok(false)) => {
                tracing::warn!(action = %request.action, "Approval denied");
                Err(CommerceError::ApprovalDenied {
                    action: request.action.clone(),
                    description: request.description.clone(),
                })
            }
            Ok(Err(e)) => {
                tracing::error!(action = %request.action, error = %e, "Approval channel failed, treating as denial");
                Err(CommerceError::ApprovalDenied {
                    action: request.action.clone(),
                    description: format!("{} (approval channel failed: {})", request.description, e),
                })
            }
            Err(_) => {
                tracing::warn!(action = %request.action, "Approval timed out");
                Err(CommerceError::ApprovalTimeout {
                    action: request.action.clone(),
                    after_secs: self.timeout.as_secs(),
                })
            }
        }
    }
}

/// Prompts on stderr and reads a y/N answer from stdin.
pub struct TerminalApproval;

#[async_trait]
impl ApprovalChannel for TerminalApproval {
    async fn request_approval(
        &self,
        action: &str,
        description: &str,
        metadata: &Value,
    ) -> Result<bool> {
        let prompt = format!(
            "\n[approval required] {}\n  {}\n  {}\nApprove? [y/N] ",
            action,
            description,
            serde_json::to_string(metadata)?
        );

        // The blocking read is abandoned, not interrupted, on timeout.
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut stderr = std::io::stderr();
            stderr.write_all(prompt.as_bytes())?;
            stderr.flush()?;
            let mut answer = String::new();
            std::io::stdin().lock().read_line(&mut answer)?;
            Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
        })
        .await
        .map_err(|e| CommerceError::Storage(format!("approval prompt task failed: {}", e)))?
    }
}

/// For unattended runs: every approval request is refused.
pub struct DenyAll;

#[async_trait]
impl ApprovalChannel for DenyAll {
    async fn request_approval(&self, action: &str, _: &str, _: &Value) -> Result<bool> {
        tracing::info!(action, "Unattended mode, refusing approval");
        Ok(false)
    }
}
