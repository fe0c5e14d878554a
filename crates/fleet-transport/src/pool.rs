//! Connection pooling and transport retry for remote-shell sessions.
//!
//! Sessions are pooled per (user, host, port). Each bucket has a fixed
//! entry cap; callers over the cap queue FIFO on the bucket's semaphore.
//! Connect attempts are retried with exponential backoff on retryable
//! transport errors; nothing else in the shell path is ever retried here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use fleet_retry::{BackoffConfig, retry_async};
use fleet_types::{Error, Result, ShellCredentials, TransportError};

use crate::shell::{RemoteShell, ShellSession};
use crate::CancelToken;

/// Pool sizing and connect behavior.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live sessions per (user, host, port).
    pub max_per_key: usize,
    pub connect_timeout: Duration,
    pub retry: BackoffConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: 4,
            connect_timeout: Duration::from_secs(10),
            retry: BackoffConfig::transport(),
        }
    }
}

struct Bucket {
    semaphore: Arc<Semaphore>,
    idle: Vec<ShellSession>,
}

/// A leased session. Return it with [`ShellPool::restore`] when the
/// connection is still good, or [`ShellPool::discard`] when it is not.
pub struct PooledSession {
    pub session: ShellSession,
    key: String,
    _permit: OwnedSemaphorePermit,
}

/// Shared session pool over any [`RemoteShell`] backend.
pub struct ShellPool {
    shell: Arc<dyn RemoteShell>,
    config: PoolConfig,
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl ShellPool {
    pub fn new(shell: Arc<dyn RemoteShell>, config: PoolConfig) -> Self {
        Self {
            shell,
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> Arc<dyn RemoteShell> {
        Arc::clone(&self.shell)
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().expect("pool lock poisoned");
        Arc::clone(buckets.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket {
                semaphore: Arc::new(Semaphore::new(self.config.max_per_key)),
                idle: Vec::new(),
            }))
        }))
    }

    fn semaphore(&self, key: &str) -> Arc<Semaphore> {
        // Cloned out so the permit wait never holds the bucket lock.
        let bucket = self.bucket(key);
        let guard = bucket.lock().expect("bucket lock poisoned");
        Arc::clone(&guard.semaphore)
    }

    /// Lease a session, reusing an idle one when available. Waits FIFO when
    /// the bucket is at its cap.
    pub async fn lease(
        &self,
        credentials: &ShellCredentials,
        cancel: &CancelToken,
    ) -> Result<PooledSession> {
        cancel.check()?;
        let key = credentials.pool_key();
        let semaphore = self.semaphore(&key);

        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| Error::Transport(TransportError::new(
                    fleet_types::TransportErrorKind::Closed,
                    "connection pool closed",
                )))?
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let bucket = self.bucket(&key);
        let reused = {
            let mut guard = bucket.lock().expect("bucket lock poisoned");
            guard.idle.pop()
        };

        let session = match reused {
            Some(session) => {
                debug!(key = %key, session = %session.id, "reusing pooled session");
                session
            }
            None => self.connect_with_retry(credentials, cancel).await?,
        };

        Ok(PooledSession {
            session,
            key,
            _permit: permit,
        })
    }

    async fn connect_with_retry(
        &self,
        credentials: &ShellCredentials,
        cancel: &CancelToken,
    ) -> Result<ShellSession> {
        let shell = Arc::clone(&self.shell);
        let timeout = self.config.connect_timeout;
        retry_async(
            &self.config.retry,
            |err: &Error| matches!(err, Error::Transport(t) if t.is_retryable()),
            |attempt| {
                let shell = Arc::clone(&shell);
                let cancel = cancel.clone();
                async move {
                    if attempt > 1 {
                        debug!(attempt, host = %credentials.hostname, "reconnecting");
                    }
                    match tokio::time::timeout(timeout, shell.connect(credentials, &cancel)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::Transport(TransportError::timeout(format!(
                            "connect to {} timed out",
                            credentials.hostname
                        )))),
                    }
                }
            },
        )
        .await
    }

    /// Return a healthy session to its bucket for reuse.
    pub fn restore(&self, lease: PooledSession) {
        let bucket = self.bucket(&lease.key);
        let mut guard = bucket.lock().expect("bucket lock poisoned");
        guard.idle.push(lease.session);
        // Permit drops here, waking the next FIFO waiter.
    }

    /// Close a session that should not be reused.
    pub async fn discard(&self, lease: PooledSession) {
        let _ = self.shell.close(lease.session).await;
    }

    /// Idle sessions currently pooled for the credentials' bucket.
    pub fn idle_count(&self, credentials: &ShellCredentials) -> usize {
        let bucket = self.bucket(&credentials.pool_key());
        let guard = bucket.lock().expect("bucket lock poisoned");
        guard.idle.len()
    }

    /// Lease, run one command, and restore the session. Transport failures
    /// discard the session instead of restoring it.
    pub async fn exec(
        &self,
        credentials: &ShellCredentials,
        command: &str,
        timeout: Duration,
        env: &std::collections::BTreeMap<String, String>,
        cancel: &CancelToken,
    ) -> Result<crate::shell::ExecResult> {
        let lease = self.lease(credentials, cancel).await?;
        let outcome = self
            .shell
            .exec(&lease.session, command, timeout, env, cancel)
            .await;
        match &outcome {
            Err(Error::Transport(_)) | Err(Error::Cancelled) => self.discard(lease).await,
            _ => self.restore(lease),
        }
        outcome
    }
}
