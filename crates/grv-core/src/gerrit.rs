//! Gerrit REST client.
//!
//! The daemon only writes to Gerrit on one path: posting a score-0 notice
//! when the AI backend hits a rate limit. Everything else the assistant does
//! against Gerrit goes through the companion `gerrit-cli` tool in its own
//! process.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// The anti-XSSI prefix Gerrit prepends to JSON response bodies.
pub const XSSI_PREFIX: &str = ")]}'";

/// HTTP request timeout for review posts.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of an automated review.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewResult {
    /// Overall review summary.
    pub summary: String,
    /// Code-Review vote: -1, 0 or +1.
    pub vote: i32,
    /// Inline comments on specific files and lines.
    pub comments: Vec<Comment>,
}

impl ReviewResult {
    /// Human-readable label for the vote.
    #[must_use]
    pub fn vote_label(&self) -> &'static str {
        match self.vote {
            -1 => "I would prefer this is not merged as is",
            0 => "No score",
            1 => "Looks good to me, but someone else must approve",
            _ => "Unknown vote",
        }
    }
}

/// A single inline comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    /// File path relative to the repository root.
    pub file: String,
    /// 1-indexed line number.
    pub line: u32,
    /// Comment text.
    pub message: String,
}

/// Errors from the REST client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GerritError {
    /// The request could not be built or sent.
    #[error("gerrit request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Gerrit answered with a non-success status.
    #[error("gerrit API returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },
}

/// Capability interface for posting reviews back to the server.
#[async_trait]
pub trait ReviewServer: Send + Sync {
    /// Posts a review on the given change/patchset.
    async fn post_review(
        &self,
        change_number: u64,
        revision_number: u32,
        result: &ReviewResult,
    ) -> Result<(), GerritError>;
}

/// Wire payload for `POST /a/changes/<C>/revisions/<P>/review`.
#[derive(Debug, Serialize)]
struct ReviewInput {
    message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<&'static str, i32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    comments: BTreeMap<String, Vec<CommentInput>>,
    drafts: &'static str,
}

#[derive(Debug, Serialize)]
struct CommentInput {
    line: u32,
    message: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    unresolved: bool,
}

/// Strips the anti-XSSI token from a Gerrit response body.
#[must_use]
pub fn strip_xssi_prefix(body: &str) -> &str {
    body.strip_prefix(XSSI_PREFIX).unwrap_or(body).trim_start()
}

fn build_review_input(result: &ReviewResult) -> ReviewInput {
    let mut comments: BTreeMap<String, Vec<CommentInput>> = BTreeMap::new();
    for c in &result.comments {
        comments.entry(c.file.clone()).or_default().push(CommentInput {
            line: c.line,
            message: c.message.clone(),
            unresolved: false,
        });
    }

    let mut message = result.summary.clone();
    if !message.is_empty() {
        message.push_str("\n\n");
    }
    message.push_str(result.vote_label());

    ReviewInput {
        message,
        labels: BTreeMap::from([("Code-Review", result.vote)]),
        comments,
        // Publish any drafts the assistant staged through the query tool.
        drafts: "PUBLISH",
    }
}

/// HTTP client for the Gerrit REST API.
pub struct GerritClient {
    base_url: String,
    username: String,
    password: SecretString,
    http: reqwest::Client,
}

impl GerritClient {
    /// Creates a client for the given base URL and basic-auth credentials.
    ///
    /// # Errors
    ///
    /// Returns [`GerritError::Transport`] if the HTTP client cannot be
    /// built.
    pub fn new(
        base_url: &str,
        username: &str,
        password: SecretString,
    ) -> Result<Self, GerritError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password,
            http,
        })
    }
}

#[async_trait]
impl ReviewServer for GerritClient {
    async fn post_review(
        &self,
        change_number: u64,
        revision_number: u32,
        result: &ReviewResult,
    ) -> Result<(), GerritError> {
        let url = format!(
            "{}/a/changes/{}/revisions/{}/review",
            self.base_url, change_number, revision_number
        );
        let input = build_review_input(result);
        debug!(%url, vote = result.vote, "posting review");

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .json(&input)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GerritError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(body = %strip_xssi_prefix(&body), "review accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_xssi_prefix_removes_the_token() {
        assert_eq!(strip_xssi_prefix(")]}'\n{\"ok\":true}"), "{\"ok\":true}");
        assert_eq!(strip_xssi_prefix("{\"ok\":true}"), "{\"ok\":true}");
    }

    #[test]
    fn review_input_carries_vote_and_drafts() {
        let result = ReviewResult {
            summary: "Automated review".to_string(),
            vote: 0,
            comments: vec![],
        };
        let input = build_review_input(&result);
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["labels"]["Code-Review"], 0);
        assert_eq!(json["drafts"], "PUBLISH");
        let message = json["message"].as_str().unwrap();
        assert!(message.starts_with("Automated review"));
        assert!(message.contains("No score"));
        assert!(json.get("comments").is_none());
    }

    #[test]
    fn review_input_groups_comments_by_file() {
        let result = ReviewResult {
            summary: "s".to_string(),
            vote: -1,
            comments: vec![
                Comment {
                    file: "src/main.rs".to_string(),
                    line: 10,
                    message: "first".to_string(),
                },
                Comment {
                    file: "src/main.rs".to_string(),
                    line: 25,
                    message: "second".to_string(),
                },
                Comment {
                    file: "README.md".to_string(),
                    line: 1,
                    message: "docs".to_string(),
                },
            ],
        };
        let json = serde_json::to_value(build_review_input(&result)).unwrap();
        assert_eq!(json["comments"]["src/main.rs"].as_array().unwrap().len(), 2);
        assert_eq!(json["comments"]["README.md"][0]["line"], 1);
        assert_eq!(json["labels"]["Code-Review"], -1);
    }

    #[test]
    fn vote_labels_cover_the_accepted_range() {
        let label = |vote| ReviewResult {
            vote,
            ..ReviewResult::default()
        }
        .vote_label();
        assert!(label(1).contains("Looks good"));
        assert!(label(-1).contains("not merged"));
        assert_eq!(label(0), "No score");
    }
}
