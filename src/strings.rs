//! Every user-visible string the External API Surface and background
//! workers can emit, defined once before first use. Mirrors
//! `pairing/model.rs`'s convention of naming error constants up front
//! instead of inlining string literals at each call site.

pub const PAIRING_USAGE: &str =
    "usage: /pair <code> — paste the pairing code shown in your agent's terminal";

pub const PAIRING_INVALID_CODE: &str =
    "that code doesn't look right — codes are letters, numbers, '_' and '-' only";

pub const PAIRING_APPROVED: &str = "device paired successfully";

pub const PAIRING_REJECTED: &str = "pairing was rejected by the node";

pub const NODE_STATUS_DEPLOYING: &str = "deploying";

pub const NODE_STATUS_READY: &str = "ready";

pub const NODE_STATUS_DEACTIVATED: &str = "deactivated";

pub const NODE_STATUS_RETRYABLE_ERROR: &str =
    "something went wrong on our end — we're retrying automatically";

pub const REDEPLOY_ALREADY_IN_FLIGHT: &str = "a deploy is already running for this node";

pub const UNAUTHENTICATED: &str = "authentication required";

pub const FORBIDDEN: &str = "not authorized for this node";

pub const UNKNOWN_SKILL: &str = "unknown skill";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_non_empty() {
        for s in [
            PAIRING_USAGE,
            PAIRING_INVALID_CODE,
            PAIRING_APPROVED,
            PAIRING_REJECTED,
            NODE_STATUS_DEPLOYING,
            NODE_STATUS_READY,
            NODE_STATUS_DEACTIVATED,
            NODE_STATUS_RETRYABLE_ERROR,
            REDEPLOY_ALREADY_IN_FLIGHT,
            UNAUTHENTICATED,
            FORBIDDEN,
            UNKNOWN_SKILL,
        ] {
            assert!(!s.is_empty());
        }
    }
}
