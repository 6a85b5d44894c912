//! Asynchronous utilities for use with Tokio.

use std::{process::Output, sync::Arc};

use anyhow::anyhow;
use regex::Regex;
use tokio::sync::watch;

use crate::prelude::*;

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. And standard error may be optionally checked against a
/// regex to determine if the command failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(regex) = error_regex {
            if regex.is_match(&stderr) {
                return Err(anyhow!(
                    "{} printed error output:\n{}",
                    command_name,
                    stderr,
                ));
            }
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// A cloneable "please stop" flag.
///
/// Work checks [`CancelToken::is_cancelled`] before starting anything new,
/// and races [`CancelToken::cancelled`] against anything slow.
#[derive(Clone, Debug)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Cancel this token and all its clones. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Has this token been cancelled?
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until this token is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // We own a sender, so this can't fail with "channel closed".
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{process::Command, time};

    use super::*;

    #[tokio::test]
    async fn test_check_for_command_failure() {
        let output = Command::new("sh")
            .args(["-c", "echo hello; exit 0"])
            .output()
            .await
            .unwrap();
        check_for_command_failure("sh", &output, None).unwrap();

        let output = Command::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .output()
            .await
            .unwrap();
        let err = check_for_command_failure("sh", &output, None)
            .unwrap_err()
            .to_string();
        assert!(err.contains("exit code 3"), "got {err:?}");
        assert!(err.contains("broken"), "got {err:?}");
    }

    #[tokio::test]
    async fn test_check_for_command_failure_with_regex() {
        let output = Command::new("sh")
            .args(["-c", "echo 'Error: bad xref' >&2; exit 0"])
            .output()
            .await
            .unwrap();
        let regex = Regex::new(r"(?m)^Error").unwrap();
        assert!(check_for_command_failure("sh", &output, Some(&regex)).is_err());
        assert!(check_for_command_failure("sh", &output, None).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn(async move { clone.cancelled().await });
        time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        token.cancel();
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }
}
