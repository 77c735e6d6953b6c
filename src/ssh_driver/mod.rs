//! Remote shell transport to fleet nodes.
//!
//! Thin async wrapper around `ssh2::Session`. `ssh2` is a blocking library
//! (like `git2`), so every call that touches the session runs inside
//! `tokio::task::spawn_blocking`, the same pattern `repo/mod.rs` uses to
//! wrap synchronous `git2::Repository` calls.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("host key fingerprint mismatch (expected {expected}, got {actual})")]
    HostKeyMismatch { expected: String, actual: String },
    #[error("exec timed out")]
    Timeout,
    #[error("exec failed: {0}")]
    Exec(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Clone)]
pub struct SshCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A live SSH session. Holds the session + TCP stream behind a `Mutex` so
/// the async handle can be cloned and shared across tasks that serialize
/// on the per-node lock (see `convergence::apply_and_verify`).
pub struct RemoteSession {
    inner: Arc<Mutex<Option<SessionInner>>>,
    pub host_key_fingerprint: String,
}

struct SessionInner {
    session: ssh2::Session,
    // Kept alive for the duration of the session; ssh2 borrows the fd.
    _stream: TcpStream,
}

// ssh2::Session is not Send by default in older versions' internal state,
// but the handle itself only ever crosses threads via spawn_blocking's
// move closures, never concurrently — safe under the single-owner-per-call
// discipline enforced by the outer Mutex.
unsafe impl Send for SessionInner {}

const CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(15);
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Connect to `creds`, retrying connection establishment up to
/// `CONNECT_RETRIES` times with a fixed delay — the node may still be
/// booting right after provider `create_node` returns.
pub async fn connect(
    creds: &SshCredentials,
    known_fingerprint: Option<&str>,
) -> Result<RemoteSession, DriverError> {
    let mut last_err = None;
    for attempt in 1..=CONNECT_RETRIES {
        match connect_once(creds, known_fingerprint).await {
            Ok(session) => return Ok(session),
            Err(e) => {
                warn!(host = %creds.host, attempt, err = %e, "ssh connect attempt failed");
                last_err = Some(e);
                if attempt < CONNECT_RETRIES {
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(DriverError::Connect("exhausted retries".into())))
}

async fn connect_once(
    creds: &SshCredentials,
    known_fingerprint: Option<&str>,
) -> Result<RemoteSession, DriverError> {
    let creds = creds.clone();
    let known_fingerprint = known_fingerprint.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || -> Result<RemoteSession, DriverError> {
        let addr = format!("{}:{}", creds.host, creds.port);
        let stream =
            TcpStream::connect(&addr).map_err(|e| DriverError::Connect(e.to_string()))?;
        stream
            .set_read_timeout(Some(DEFAULT_EXEC_TIMEOUT))
            .map_err(|e| DriverError::Io(e.to_string()))?;

        let mut session = ssh2::Session::new().map_err(|e| DriverError::Connect(e.to_string()))?;
        session.set_tcp_stream(stream.try_clone().map_err(|e| DriverError::Io(e.to_string()))?);
        session
            .handshake()
            .map_err(|e| DriverError::Connect(e.to_string()))?;

        let fingerprint = session
            .host_key()
            .map(|(key, _)| sha256_hex(key))
            .ok_or_else(|| DriverError::Connect("no host key presented".into()))?;

        if let Some(expected) = &known_fingerprint {
            if expected != &fingerprint {
                return Err(DriverError::HostKeyMismatch {
                    expected: expected.clone(),
                    actual: fingerprint,
                });
            }
        }

        session
            .userauth_password(&creds.user, &creds.password)
            .map_err(|e| DriverError::AuthFailed(e.to_string()))?;
        if !session.authenticated() {
            return Err(DriverError::AuthFailed("not authenticated".into()));
        }

        Ok(RemoteSession {
            inner: Arc::new(Mutex::new(Some(SessionInner {
                session,
                _stream: stream,
            }))),
            host_key_fingerprint: fingerprint,
        })
    })
    .await
    .map_err(|e| DriverError::Io(e.to_string()))?
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Run one command over `session`, collecting stdout/stderr and enforcing
/// `timeout` around the blocking join. On timeout the session is marked
/// unusable — the caller must reconnect; no attempt is made to interrupt
/// the remote command.
pub async fn exec(
    session: &RemoteSession,
    cmd: &str,
    timeout: Duration,
) -> Result<ExecOutput, DriverError> {
    let inner = session.inner.clone();
    let cmd = cmd.to_string();

    let join = tokio::task::spawn_blocking(move || -> Result<ExecOutput, DriverError> {
        let mut guard = inner.lock().unwrap();
        let state = guard.as_mut().ok_or(DriverError::Timeout)?;

        let mut channel = state
            .session
            .channel_session()
            .map_err(|e| DriverError::Exec(e.to_string()))?;
        channel
            .exec(&cmd)
            .map_err(|e| DriverError::Exec(e.to_string()))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| DriverError::Io(e.to_string()))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| DriverError::Io(e.to_string()))?;

        channel
            .wait_close()
            .map_err(|e| DriverError::Exec(e.to_string()))?;
        let exit_code = channel
            .exit_status()
            .map_err(|e| DriverError::Exec(e.to_string()))?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    });

    match tokio::time::timeout(timeout, join).await {
        Ok(Ok(result)) => {
            let out = result?;
            debug!(exit_code = out.exit_code, "ssh exec completed");
            Ok(out)
        }
        Ok(Err(e)) => Err(DriverError::Io(e.to_string())),
        Err(_) => {
            // Mark the session unusable — we gave up waiting, not the
            // remote command. A fresh `connect` is required afterwards.
            *session.inner.lock().unwrap() = None;
            Err(DriverError::Timeout)
        }
    }
}

/// Write `bytes` to `remote_path` atomically: stage via `scp_send` to a
/// temp path, then `mv` into place with a single `exec`. Avoids ever
/// embedding file content inside a shell string.
pub async fn upload(
    session: &RemoteSession,
    bytes: Vec<u8>,
    remote_path: &str,
) -> Result<(), DriverError> {
    let inner = session.inner.clone();
    let staging_path = format!("{remote_path}.staging-{}", uuid::Uuid::new_v4());
    let staging_path_clone = staging_path.clone();
    let len = bytes.len() as u64;

    let join = tokio::task::spawn_blocking(move || -> Result<(), DriverError> {
        let mut guard = inner.lock().unwrap();
        let state = guard.as_mut().ok_or(DriverError::Timeout)?;

        let mut remote_file = state
            .session
            .scp_send(
                std::path::Path::new(&staging_path_clone),
                0o600,
                len,
                None,
            )
            .map_err(|e| DriverError::Exec(e.to_string()))?;
        remote_file
            .write_all(&bytes)
            .map_err(|e| DriverError::Io(e.to_string()))?;
        remote_file.send_eof().map_err(|e| DriverError::Io(e.to_string()))?;
        remote_file
            .wait_eof()
            .map_err(|e| DriverError::Io(e.to_string()))?;
        remote_file
            .close()
            .map_err(|e| DriverError::Io(e.to_string()))?;
        remote_file
            .wait_close()
            .map_err(|e| DriverError::Io(e.to_string()))?;
        Ok(())
    });

    tokio::time::timeout(DEFAULT_EXEC_TIMEOUT, join)
        .await
        .map_err(|_| DriverError::Timeout)?
        .map_err(|e| DriverError::Io(e.to_string()))??;

    let mv_cmd = format!(
        "mv {} {}",
        shell_quote(&staging_path),
        shell_quote(remote_path)
    );
    let out = exec(session, &mv_cmd, DEFAULT_EXEC_TIMEOUT).await?;
    if out.exit_code != 0 {
        return Err(DriverError::Exec(format!(
            "mv to {remote_path} failed: {}",
            out.stderr
        )));
    }
    Ok(())
}

/// Single-quote a value for safe interpolation into a shell command.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Idempotent close; also effectively happens on `Drop` since the inner
/// `ssh2::Session`/`TcpStream` are dropped with the last `Arc` reference.
pub async fn close(session: &RemoteSession) {
    *session.inner.lock().unwrap() = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[test]
    fn sha256_hex_is_deterministic() {
        let a = sha256_hex(b"host-key-bytes");
        let b = sha256_hex(b"host-key-bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
