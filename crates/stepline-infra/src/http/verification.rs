//! HTTP implementation of the verification channel.
//!
//! Submits the subject's fields as JSON to the verification endpoint and
//! decodes the reply into the disposition the controller acts on. A parsed
//! rejection is a normal reply; only transport and access failures become
//! errors.

use std::collections::BTreeMap;

use reqwest::StatusCode;
use serde::Serialize;
use stepline_core::verification::{VerificationChannel, VerificationError, VerificationReply};
use stepline_types::subject::Subject;

/// Verification channel backed by an HTTP endpoint.
pub struct HttpVerificationChannel {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVerificationChannel {
    /// Create a channel posting to the given endpoint URL.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmissionDto<'a> {
    address: &'a str,
    fields: BTreeMap<&'a str, &'a str>,
}

fn submission<'a>(subject: &'a Subject, address: &'a str) -> SubmissionDto<'a> {
    SubmissionDto {
        address,
        fields: subject
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.value.as_str()))
            .collect(),
    }
}

impl VerificationChannel for HttpVerificationChannel {
    async fn submit(
        &self,
        subject: &Subject,
        address: &str,
    ) -> Result<VerificationReply, VerificationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&submission(subject, address))
            .send()
            .await
            .map_err(|e| VerificationError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => {
                Err(VerificationError::Blocked(format!("HTTP {}", response.status())))
            }
            status if !status.is_success() => {
                Err(VerificationError::Request(format!("HTTP {status}")))
            }
            _ => response
                .json::<VerificationReply>()
                .await
                .map_err(|e| VerificationError::Request(e.to_string())),
        }
    }
}
