//! Pairing-code approval: the one-time handshake by which the runtime
//! accepts a messaging-channel peer as allowed.
//!
//! Grounded on the teacher's PIN-validation discipline (validate before
//! touching any subprocess/shell) — here the thing being validated is the
//! code handed to the runtime's `pairing approve` CLI over the Remote
//! Shell Driver, rather than a locally-stored PIN row.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::ssh_driver::{self, DriverError, RemoteSession};

/// `^[A-Za-z0-9_-]{1,64}$` — checked before the code ever reaches a shell
/// string, regardless of `shell_quote`'s own escaping.
static CODE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

const EXEC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("invalid pairing code")]
    InvalidCode,
    #[error("pairing rejected by node")]
    Rejected,
    #[error(transparent)]
    Transport(#[from] DriverError),
}

/// `true` iff `code` matches `^[A-Za-z0-9_-]{1,64}$`. Callers must check
/// this before doing anything else with `code` — a failing code never
/// touches the shell at all.
pub fn is_valid_code(code: &str) -> bool {
    CODE_PATTERN.is_match(code)
}

/// Approve a pairing code on `session`'s runtime. Validates the code
/// against `CODE_PATTERN` first; only a validated code is shell-quoted and
/// handed to the runtime's pairing CLI.
pub async fn approve(session: &RemoteSession, code: &str) -> Result<(), PairingError> {
    if !is_valid_code(code) {
        return Err(PairingError::InvalidCode);
    }
    let cmd = format!(
        "docker exec agent-runtime agent-cli pairing approve {}",
        ssh_driver::shell_quote(code)
    );
    let out = ssh_driver::exec(session, &cmd, EXEC_TIMEOUT).await?;
    if out.exit_code != 0 {
        return Err(PairingError::Rejected);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_letters_digits_underscore_dash() {
        assert!(is_valid_code("ABCD1234"));
        assert!(is_valid_code("a-b_c9"));
    }

    #[test]
    fn rejects_empty_and_overlong_codes() {
        assert!(!is_valid_code(""));
        assert!(!is_valid_code(&"a".repeat(65)));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(!is_valid_code("abc; rm -rf /"));
        assert!(!is_valid_code("abc$(whoami)"));
        assert!(!is_valid_code("abc'def"));
        assert!(!is_valid_code("abc def"));
    }

    #[test]
    fn max_length_boundary() {
        assert!(is_valid_code(&"a".repeat(64)));
        assert!(!is_valid_code(&"a".repeat(65)));
    }
}
