//! Verification channel boundary.
//!
//! The final step of a run typically submits the subject to an external
//! verification service and interprets the reply. The engine only needs the
//! reply's disposition and the error ids backing it; the transport lives in
//! the infra crate.

use serde::{Deserialize, Serialize};
use stepline_types::subject::Subject;

// ---------------------------------------------------------------------------
// Disposition / VerificationReply
// ---------------------------------------------------------------------------

/// What the verification service told us to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Accepted; the subject is done.
    Advance,
    /// The service wants an out-of-band confirmation round first.
    EmailLoop,
    /// Rejected for this subject; no retry will change the answer.
    Fatal,
}

/// Parsed reply from the verification service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReply {
    /// The next-action disposition.
    pub disposition: Disposition,
    /// Service-side error identifiers, kept verbatim for the audit trail.
    #[serde(default)]
    pub error_ids: Vec<String>,
}

impl VerificationReply {
    /// An unconditional acceptance.
    pub fn accepted() -> Self {
        Self {
            disposition: Disposition::Advance,
            error_ids: Vec::new(),
        }
    }

    /// A rejection carrying the service's error ids.
    pub fn rejected(error_ids: Vec<String>) -> Self {
        Self {
            disposition: Disposition::Fatal,
            error_ids,
        }
    }
}

// ---------------------------------------------------------------------------
// VerificationChannel trait
// ---------------------------------------------------------------------------

/// Transport for submitting a subject to the verification service.
pub trait VerificationChannel: Send + Sync {
    /// Submit `subject` (reachable at `address` for the confirmation loop)
    /// and return the parsed reply.
    fn submit(
        &self,
        subject: &Subject,
        address: &str,
    ) -> impl std::future::Future<Output = Result<VerificationReply, VerificationError>> + Send;
}

// ---------------------------------------------------------------------------
// VerificationError
// ---------------------------------------------------------------------------

/// Transport-level verification failures (a parsed rejection is a
/// `VerificationReply`, not an error).
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// The service blocked us at the access level (rate limit, IP block).
    #[error("verification access blocked: {0}")]
    Blocked(String),

    /// Request failed or the reply could not be parsed.
    #[error("verification request failed: {0}")]
    Request(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
