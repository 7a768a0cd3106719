//! External channel poller.
//!
//! Some steps depend on a token delivered out-of-band (a verification code or
//! link arriving on a message channel). The channel is eventually consistent:
//! messages appear with unpredictable delay, so the poller re-fetches on an
//! interval with a bounded round count rather than waiting on a push. Running
//! out of rounds is an expected outcome (`PollOutcome::Exhausted`), not an
//! error; the retry policy treats it as Transient.

use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// ChannelMessage / MessageSource
// ---------------------------------------------------------------------------

/// One message fetched from the external channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Short headline of the message.
    pub subject: String,
    /// Full body text.
    pub body: String,
    /// When the channel says the message arrived.
    pub date: DateTime<Utc>,
}

/// Source of channel messages for an address.
///
/// Implemented over whatever transport the host uses (HTTP inbox API in the
/// infra crate, scripted fixtures in tests).
pub trait MessageSource: Send + Sync {
    /// Fetch all currently visible messages for `address`.
    fn fetch(
        &self,
        address: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ChannelMessage>, PollError>> + Send;
}

// ---------------------------------------------------------------------------
// ChannelPoller
// ---------------------------------------------------------------------------

/// Outcome of a bounded polling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A token was found.
    Match(String),
    /// All polling rounds elapsed without a usable token.
    Exhausted,
}

/// Polls a `MessageSource` for a token matching an expected pattern.
pub struct ChannelPoller<M: MessageSource> {
    source: M,
    fallback: Regex,
}

/// Fallback shape: any 4-8 digit run, for senders that deviate from the
/// expected template.
const FALLBACK_TOKEN_PATTERN: &str = r"\b[0-9]{4,8}\b";

impl<M: MessageSource> ChannelPoller<M> {
    /// Build a poller with the default fallback token shape.
    pub fn new(source: M) -> Self {
        Self {
            source,
            // Pattern is a checked constant.
            fallback: Regex::new(FALLBACK_TOKEN_PATTERN).unwrap(),
        }
    }

    /// Override the fallback token pattern.
    pub fn with_fallback(mut self, fallback: Regex) -> Self {
        self.fallback = fallback;
        self
    }

    /// Poll for a token, up to `max_rounds` fetches spaced `interval` apart.
    ///
    /// Each round fetches the full message list and extracts against
    /// `pattern` first, then against the broader fallback shape. When
    /// several messages match, the most recently dated one wins (a re-sent
    /// code invalidates earlier ones).
    pub async fn poll(
        &self,
        address: &str,
        pattern: &Regex,
        max_rounds: u32,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, PollError> {
        for round in 1..=max_rounds.max(1) {
            if cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }
            let messages = self.source.fetch(address).await?;
            tracing::debug!(round, count = messages.len(), "channel poll round");

            if let Some(token) = extract_latest(&messages, pattern)
                .or_else(|| extract_latest(&messages, &self.fallback))
            {
                return Ok(PollOutcome::Match(token));
            }

            if round < max_rounds {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => return Err(PollError::Cancelled),
                }
            }
        }
        tracing::debug!(address, max_rounds, "channel polling exhausted");
        Ok(PollOutcome::Exhausted)
    }
}

/// Extract the token from the most recently dated matching message.
fn extract_latest(messages: &[ChannelMessage], pattern: &Regex) -> Option<String> {
    messages
        .iter()
        .filter_map(|m| {
            let text = format!("{}\n{}", m.subject, m.body);
            pattern.captures(&text).map(|caps| {
                let token = caps
                    .get(1)
                    .unwrap_or_else(|| caps.get(0).unwrap())
                    .as_str()
                    .to_string();
                (m.date, token)
            })
        })
        .max_by_key(|(date, _)| *date)
        .map(|(_, token)| token)
}

// ---------------------------------------------------------------------------
// PollError
// ---------------------------------------------------------------------------

/// Channel infrastructure failures (distinct from "no token yet").
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Transport-level failure fetching messages.
    #[error("channel request failed: {0}")]
    Request(String),

    /// The channel denied access (credentials, revoked mailbox).
    #[error("channel access denied: {0}")]
    AccessDenied(String),

    /// Polling was cancelled by a stop request.
    #[error("channel polling cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
