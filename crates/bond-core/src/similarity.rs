//! Client for the remote profile-similarity endpoint.
//!
//! The endpoint takes two identities and answers with a cosine similarity
//! score, optional one-sentence summaries keyed by identity and optional
//! icebreaker suggestions. Callers fall back to [`Similarity::fallback`] on
//! any error; a missing score never blocks pairing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::types::Identity;

/// Summary shown when the endpoint is unreachable or has nothing to say.
pub const PLACEHOLDER_SUMMARY: &str = "No profile summary available yet.";

/// Errors from a similarity request.
#[derive(Debug, Error)]
pub enum SimilarityError {
    /// Transport failure or undecodable body.
    #[error("Similarity request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("Similarity endpoint returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The endpoint answered but reported failure.
    #[error("Similarity endpoint rejected the request: {message}")]
    Rejected {
        /// Message from the endpoint, if any.
        message: String,
    },

    /// A required response field was absent.
    #[error("Similarity response is missing '{0}'")]
    MissingField(&'static str),

    /// No endpoint is configured.
    #[error("No similarity endpoint configured")]
    NotConfigured,
}

/// Similarity between the owner and one peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Similarity {
    /// Score in `[0, 1]`.
    pub score: f64,
    /// One-line description of the peer.
    pub peer_summary: String,
    /// Conversation starters, if the endpoint produced any.
    pub icebreakers: Vec<String>,
}

impl Similarity {
    /// Zero score with placeholder text.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            score: 0.0,
            peer_summary: PLACEHOLDER_SUMMARY.to_string(),
            icebreakers: Vec::new(),
        }
    }
}

/// Source of similarity scores.
#[async_trait]
pub trait SimilarityProvider: Send + Sync {
    /// Score `me` against `peer`.
    async fn score(&self, me: &Identity, peer: &Identity) -> Result<Similarity, SimilarityError>;
}

/// Provider used when no endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackSimilarity;

#[async_trait]
impl SimilarityProvider for FallbackSimilarity {
    async fn score(&self, _me: &Identity, _peer: &Identity) -> Result<Similarity, SimilarityError> {
        Err(SimilarityError::NotConfigured)
    }
}

#[derive(Debug, Serialize)]
struct SimilarityRequest<'a> {
    #[serde(rename = "profileA")]
    profile_a: &'a str,
    #[serde(rename = "profileB")]
    profile_b: &'a str,
}

#[derive(Debug, Deserialize)]
struct SimilarityResponse {
    #[serde(default)]
    ok: bool,
    similarity: Option<f64>,
    #[serde(default)]
    summaries: HashMap<String, Option<String>>,
    #[serde(default)]
    icebreakers: Option<Vec<String>>,
    #[serde(default)]
    error: Option<String>,
}

/// Interpret a decoded response body for `peer`.
fn interpret(response: SimilarityResponse, peer: &Identity) -> Result<Similarity, SimilarityError> {
    if !response.ok {
        return Err(SimilarityError::Rejected {
            message: response
                .error
                .unwrap_or_else(|| "ok flag not set".to_string()),
        });
    }
    let score = response
        .similarity
        .filter(|s| s.is_finite())
        .ok_or(SimilarityError::MissingField("similarity"))?;

    let peer_summary = response
        .summaries
        .get(peer.as_str())
        .cloned()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| PLACEHOLDER_SUMMARY.to_string());

    Ok(Similarity {
        score: score.clamp(0.0, 1.0),
        peer_summary,
        icebreakers: response.icebreakers.unwrap_or_default(),
    })
}

/// Parse a raw response body for `peer`.
///
/// # Errors
///
/// Returns an error when the body is not JSON, `ok` is not true, or
/// `similarity` is missing.
pub fn parse_response(body: &str, peer: &Identity) -> Result<Similarity, SimilarityError> {
    let response: SimilarityResponse = serde_json::from_str(body).map_err(|e| {
        SimilarityError::Rejected {
            message: format!("undecodable body: {e}"),
        }
    })?;
    interpret(response, peer)
}

/// HTTP client for the similarity endpoint.
#[derive(Debug, Clone)]
pub struct HttpSimilarityClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpSimilarityClient {
    /// Create a client posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, SimilarityError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    /// The configured endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl SimilarityProvider for HttpSimilarityClient {
    #[instrument(skip(self), fields(me = %me, peer = %peer))]
    async fn score(&self, me: &Identity, peer: &Identity) -> Result<Similarity, SimilarityError> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(&SimilarityRequest {
                profile_a: me.as_str(),
                profile_b: peer.as_str(),
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SimilarityError::Status {
                status: status.as_u16(),
            });
        }

        let body: SimilarityResponse = resp.json().await?;
        let similarity = interpret(body, peer)?;
        debug!(score = similarity.score, "Fetched similarity");
        Ok(similarity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    #[test]
    fn test_parse_full_response() {
        let body = r#"{
            "ok": true,
            "similarity": 0.82,
            "summaries": {"alice": "Climbs on weekends.", "bob": "Bakes sourdough."},
            "icebreakers": ["Ask about starters", "Favourite crag?"]
        }"#;
        let parsed = parse_response(body, &id("bob")).unwrap();
        assert!((parsed.score - 0.82).abs() < f64::EPSILON);
        assert_eq!(parsed.peer_summary, "Bakes sourdough.");
        assert_eq!(parsed.icebreakers.len(), 2);
    }

    #[test]
    fn test_null_summary_and_icebreakers_use_placeholder() {
        let body =
            r#"{"ok": true, "similarity": 0.4, "summaries": {"bob": null}, "icebreakers": null}"#;
        let parsed = parse_response(body, &id("bob")).unwrap();
        assert_eq!(parsed.peer_summary, PLACEHOLDER_SUMMARY);
        assert!(parsed.icebreakers.is_empty());
    }

    #[test]
    fn test_score_is_clamped() {
        let body = r#"{"ok": true, "similarity": -0.3}"#;
        assert!(parse_response(body, &id("bob")).unwrap().score.abs() < f64::EPSILON);
        let body = r#"{"ok": true, "similarity": 1.7}"#;
        assert!((parse_response(body, &id("bob")).unwrap().score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_similarity_is_error() {
        let err = parse_response(r#"{"ok": true}"#, &id("bob")).unwrap_err();
        assert!(matches!(err, SimilarityError::MissingField("similarity")));
    }

    #[test]
    fn test_error_body_is_rejected() {
        let err =
            parse_response(r#"{"error": "Vector file not found: bob"}"#, &id("bob")).unwrap_err();
        match err {
            SimilarityError::Rejected { message } => assert!(message.contains("bob")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_request_uses_profile_field_names() {
        let json = serde_json::to_value(SimilarityRequest {
            profile_a: "alice",
            profile_b: "bob",
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"profileA": "alice", "profileB": "bob"}));
    }

    #[tokio::test]
    async fn test_fallback_provider_is_not_configured() {
        let err = FallbackSimilarity.score(&id("alice"), &id("bob")).await.unwrap_err();
        assert!(matches!(err, SimilarityError::NotConfigured));
        assert_eq!(Similarity::fallback().score, 0.0);
    }
}
