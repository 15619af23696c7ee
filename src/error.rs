//! Admission outcomes sent back to clients in `OK` and `CLOSED` frames.

use std::fmt;

use thiserror::Error;

/// Machine-readable reason prefix understood by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Invalid,
    Blocked,
    Restricted,
    AuthRequired,
    RateLimited,
    Duplicate,
    Error,
    Pow,
}

impl Prefix {
    pub fn as_str(self) -> &'static str {
        match self {
            Prefix::Invalid => "invalid",
            Prefix::Blocked => "blocked",
            Prefix::Restricted => "restricted",
            Prefix::AuthRequired => "auth-required",
            Prefix::RateLimited => "rate-limited",
            Prefix::Duplicate => "duplicate",
            Prefix::Error => "error",
            Prefix::Pow => "pow",
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected event or subscription.
///
/// Renders as `"prefix: message"`, the exact string placed in the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{prefix}: {message}")]
pub struct Reject {
    pub prefix: Prefix,
    pub message: String,
}

impl Reject {
    pub fn new(prefix: Prefix, message: impl Into<String>) -> Self {
        Self {
            prefix,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Prefix::Invalid, message)
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(Prefix::Blocked, message)
    }

    pub fn restricted(message: impl Into<String>) -> Self {
        Self::new(Prefix::Restricted, message)
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::new(Prefix::AuthRequired, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(Prefix::RateLimited, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Prefix::Error, message)
    }

    /// The event or subscription needs an authenticated key before retrying.
    pub fn wants_auth(&self) -> bool {
        self.prefix == Prefix::AuthRequired
    }
}

/// Result of a policy check.
pub type Verdict = Result<(), Reject>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_with_prefix() {
        assert_eq!(
            Reject::blocked("not authorized").to_string(),
            "blocked: not authorized"
        );
        assert_eq!(
            Reject::auth_required("this group is private").to_string(),
            "auth-required: this group is private"
        );
    }

    #[test]
    fn auth_flag() {
        assert!(Reject::auth_required("x").wants_auth());
        assert!(!Reject::restricted("x").wants_auth());
    }
}
