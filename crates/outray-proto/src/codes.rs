//! Named constants for the error codes a tunnel server can send.
//!
//! The client only assigns behaviour to a handful of them; everything else
//! is surfaced to the embedding application unchanged.

use std::fmt;

// ---------------------------------------------------------------------------
// Wire strings
// ---------------------------------------------------------------------------

/// The requested subdomain is held by another connection.
pub const SUBDOMAIN_IN_USE: &str = "SUBDOMAIN_IN_USE";

/// The API key was rejected.
pub const AUTH_FAILED: &str = "AUTH_FAILED";

/// The account has hit its tunnel quota.
pub const LIMIT_EXCEEDED: &str = "LIMIT_EXCEEDED";

/// The requested subdomain is not a valid hostname label.
pub const INVALID_SUBDOMAIN: &str = "INVALID_SUBDOMAIN";

/// The custom domain has not been set up on the server.
pub const CUSTOM_DOMAIN_NOT_CONFIGURED: &str = "CUSTOM_DOMAIN_NOT_CONFIGURED";

/// Classified `error.code` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    SubdomainInUse,
    AuthFailed,
    LimitExceeded,
    InvalidSubdomain,
    CustomDomainNotConfigured,
    Other(String),
}

impl ErrorCode {
    pub fn from_code(code: &str) -> Self {
        match code {
            SUBDOMAIN_IN_USE => Self::SubdomainInUse,
            AUTH_FAILED => Self::AuthFailed,
            LIMIT_EXCEEDED => Self::LimitExceeded,
            INVALID_SUBDOMAIN => Self::InvalidSubdomain,
            CUSTOM_DOMAIN_NOT_CONFIGURED => Self::CustomDomainNotConfigured,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::SubdomainInUse => SUBDOMAIN_IN_USE,
            Self::AuthFailed => AUTH_FAILED,
            Self::LimitExceeded => LIMIT_EXCEEDED,
            Self::InvalidSubdomain => INVALID_SUBDOMAIN,
            Self::CustomDomainNotConfigured => CUSTOM_DOMAIN_NOT_CONFIGURED,
            Self::Other(code) => code,
        }
    }

    /// Fatal codes end the session: no further reconnects are attempted.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed | Self::LimitExceeded)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
