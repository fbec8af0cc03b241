//! Scoring service reached over HTTP.
//!
//! The server is expected to expose one endpoint:
//! - `POST {base_url}/score` -- body: `{"molecules": ["CCO", ...]}`
//!
//! returning JSON matching [`ScoreResponse`], one entry per molecule in input
//! order. Anything else fails the whole batch.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{Environment, ScoredBatch};

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    molecules: &'a [String],
}

/// The JSON shape returned by the scoring server.
#[derive(Debug, Deserialize)]
struct ScoreResponse {
    scores: Vec<f64>,
    valid: Vec<bool>,
}

/// An environment backed by an external property-prediction server.
#[derive(Debug, Clone)]
pub struct RemoteEnvironment {
    /// Base URL of the scoring server (e.g. `http://localhost:8100`).
    base_url: String,
    http: reqwest::Client,
}

impl RemoteEnvironment {
    /// Create a client for the server at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for scoring server")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Environment for RemoteEnvironment {
    async fn score(&self, molecules: &[String]) -> Result<ScoredBatch> {
        if molecules.is_empty() {
            return Ok(ScoredBatch::default());
        }

        let resp = self
            .http
            .post(format!("{}/score", self.base_url))
            .json(&ScoreRequest { molecules })
            .send()
            .await
            .context("failed to reach scoring server")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("scoring server returned {status}: {text}");
        }

        let body: ScoreResponse = resp
            .json()
            .await
            .context("failed to parse scoring server response")?;

        let out = ScoredBatch {
            scores: body.scores,
            valid: body.valid,
        };
        out.check_len(molecules.len())?;
        if out.scores.iter().any(|s| !s.is_finite()) {
            bail!("scoring server returned non-finite scores");
        }

        debug!(
            molecules = molecules.len(),
            valid_fraction = out.valid_fraction(),
            "remote batch scored"
        );
        Ok(out)
    }

    fn name(&self) -> &str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let env = RemoteEnvironment::new("http://localhost:8100/", Duration::from_secs(5)).unwrap();
        assert_eq!(env.base_url(), "http://localhost:8100");
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        // Port 9 (discard) is never contacted for an empty batch.
        let env = RemoteEnvironment::new("http://127.0.0.1:9", Duration::from_millis(50)).unwrap();
        let out = env.score(&[]).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_batch() {
        let env = RemoteEnvironment::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(env.score(&["CCO".to_string()]).await.is_err());
    }

    #[test]
    fn test_response_shape_parses() {
        let body: ScoreResponse =
            serde_json::from_str(r#"{"scores": [0.2, 0.9], "valid": [true, false]}"#).unwrap();
        assert_eq!(body.scores.len(), 2);
        assert_eq!(body.valid, vec![true, false]);
    }
}
