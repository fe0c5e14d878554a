//! Remote-shell adapter contract.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_types::{Error, Result, ShellCredentials};

use crate::CancelToken;

/// An established shell session. Opaque to callers; the `pool_key` ties it
/// back to its (user, host, port) pool bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSession {
    pub id: String,
    pub pool_key: String,
}

/// Outcome of a remote command. A non-zero exit code is not a transport
/// error; callers decide what it means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into a remote failure carrying stderr.
    pub fn ok(self) -> Result<ExecResult> {
        if self.success() {
            Ok(self)
        } else {
            let detail = if self.stderr.trim().is_empty() {
                self.stdout
            } else {
                self.stderr
            };
            Err(Error::Remote(format!(
                "exit code {}: {}",
                self.exit_code,
                tail(&detail, 500)
            )))
        }
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Outcome of an upload: bytes moved plus the digest of what landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub bytes: u64,
    pub sha256: String,
}

/// Remote shell access to an asset.
///
/// Implementations retry nothing themselves; [`crate::pool::ShellPool`]
/// wraps connect attempts with transport backoff. Non-zero exit codes are
/// never retried anywhere.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Open a session for the given credentials.
    async fn connect(
        &self,
        credentials: &ShellCredentials,
        cancel: &CancelToken,
    ) -> Result<ShellSession>;

    /// Run a command with a deadline and extra environment.
    async fn exec(
        &self,
        session: &ShellSession,
        command: &str,
        timeout: Duration,
        env: &BTreeMap<String, String>,
        cancel: &CancelToken,
    ) -> Result<ExecResult>;

    /// Copy a local file to the remote path.
    async fn upload(
        &self,
        session: &ShellSession,
        local: &Path,
        remote: &str,
        cancel: &CancelToken,
    ) -> Result<UploadResult>;

    /// Copy a remote file to the local path, returning bytes written.
    async fn download(
        &self,
        session: &ShellSession,
        remote: &str,
        local: &Path,
        cancel: &CancelToken,
    ) -> Result<u64>;

    /// Cheap reachability check without keeping a session.
    async fn validate(&self, credentials: &ShellCredentials) -> Result<bool>;

    /// Tear the session down, releasing the remote end.
    async fn close(&self, session: ShellSession) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_result_ok_passes_zero_exit() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "done".to_string(),
            stderr: String::new(),
            duration: Duration::from_millis(12),
        };
        assert!(result.ok().is_ok());
    }

    #[test]
    fn exec_result_ok_surfaces_stderr() {
        let result = ExecResult {
            exit_code: 2,
            stdout: String::new(),
            stderr: "make: *** [vmlinux] Error 2".to_string(),
            duration: Duration::from_secs(90),
        };
        match result.ok() {
            Err(Error::Remote(message)) => {
                assert!(message.contains("exit code 2"));
                assert!(message.contains("vmlinux"));
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn exec_result_ok_falls_back_to_stdout() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "fatal: repository not found".to_string(),
            stderr: "  ".to_string(),
            duration: Duration::from_millis(300),
        };
        match result.ok() {
            Err(Error::Remote(message)) => assert!(message.contains("repository not found")),
            other => panic!("expected remote error, got {:?}", other),
        }
    }
}
