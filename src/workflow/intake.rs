//! Authenticated intake of issue events and human replies.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};

use super::collaborator::MARKER_PREFIX;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

pub const DEFAULT_ACTIONS: [&str; 4] = ["opened", "edited", "labeled", "assigned"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IntakeError {
    #[error("missing {SIGNATURE_HEADER} signature")]
    MissingSignature,
    #[error("signature must look like sha256=<hex>")]
    MalformedSignature,
    #[error("signature does not match payload")]
    BadSignature,
    #[error("webhook secret is empty")]
    EmptySecret,
    #[error("malformed event payload: {0}")]
    Payload(String),
}

/// The issue a workflow is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub repository: String,
    pub sender: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueEvent {
    pub action: String,
    pub issue: IssuePayload,
    pub repository: RepositoryPayload,
    pub sender: UserPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuePayload {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryPayload {
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPayload {
    pub login: String,
}

/// An `issue_comment` event, used as the correlated human reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CommentEvent {
    pub action: String,
    pub issue: CommentIssue,
    pub comment: CommentPayload,
    pub repository: RepositoryPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentIssue {
    pub number: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentPayload {
    pub body: String,
    pub user: UserPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeDecision {
    Accepted(IssueRef),
    Ignored { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub issue: u64,
    pub author: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyDecision {
    Reply(Reply),
    Ignored { reason: String },
}

/// Verify a `sha256=<hex>` HMAC over the raw body in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> Result<(), IntakeError> {
    if secret.is_empty() {
        return Err(IntakeError::EmptySecret);
    }
    let hex_digest = signature
        .trim()
        .strip_prefix("sha256=")
        .ok_or(IntakeError::MalformedSignature)?;
    let expected = hex::decode(hex_digest).map_err(|_| IntakeError::MalformedSignature)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| IntakeError::EmptySecret)?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| IntakeError::BadSignature)
}

/// Compute the header value for `body`. Used by tests and tooling.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, IntakeError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| IntakeError::EmptySecret)?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[derive(Debug, Clone)]
pub struct Intake {
    secret: Vec<u8>,
    repository: String,
    actions: Vec<String>,
}

impl Intake {
    pub fn new(secret: impl Into<Vec<u8>>, repository: impl Into<String>, actions: Vec<String>) -> Self {
        Self {
            secret: secret.into(),
            repository: repository.into(),
            actions,
        }
    }

    fn authenticate(&self, body: &[u8], signature: Option<&str>) -> Result<(), IntakeError> {
        let signature = signature.ok_or(IntakeError::MissingSignature)?;
        verify_signature(&self.secret, body, signature)
    }

    fn same_repository(&self, full_name: &str) -> bool {
        self.repository.eq_ignore_ascii_case(full_name)
    }

    /// Authenticate, then decide whether the event starts or refreshes a workflow.
    pub fn issue_event(&self, body: &[u8], signature: Option<&str>) -> Result<IntakeDecision, IntakeError> {
        self.authenticate(body, signature)?;
        let event: IssueEvent =
            serde_json::from_slice(body).map_err(|e| IntakeError::Payload(e.to_string()))?;

        if !self.same_repository(&event.repository.full_name) {
            debug!(repository = %event.repository.full_name, "ignoring event from other repository");
            return Ok(IntakeDecision::Ignored {
                reason: format!("repository {} is not {}", event.repository.full_name, self.repository),
            });
        }
        if !self.actions.iter().any(|a| a == &event.action) {
            debug!(action = %event.action, "ignoring action");
            return Ok(IntakeDecision::Ignored {
                reason: format!("action {} is not handled", event.action),
            });
        }

        info!(issue = event.issue.number, action = %event.action, sender = %event.sender.login, "issue accepted");
        Ok(IntakeDecision::Accepted(IssueRef {
            number: event.issue.number,
            title: event.issue.title,
            body: event.issue.body.unwrap_or_default(),
            repository: event.repository.full_name,
            sender: event.sender.login,
        }))
    }

    /// Authenticate, then extract a human reply from an `issue_comment` event.
    pub fn comment_event(&self, body: &[u8], signature: Option<&str>) -> Result<ReplyDecision, IntakeError> {
        self.authenticate(body, signature)?;
        let event: CommentEvent =
            serde_json::from_slice(body).map_err(|e| IntakeError::Payload(e.to_string()))?;

        if !self.same_repository(&event.repository.full_name) {
            return Ok(ReplyDecision::Ignored {
                reason: format!("repository {} is not {}", event.repository.full_name, self.repository),
            });
        }
        if event.action != "created" {
            return Ok(ReplyDecision::Ignored {
                reason: format!("comment action {} is not handled", event.action),
            });
        }
        if event.comment.body.contains(MARKER_PREFIX) {
            return Ok(ReplyDecision::Ignored {
                reason: "comment was posted by tandem".into(),
            });
        }
        Ok(ReplyDecision::Reply(Reply {
            issue: event.issue.number,
            author: event.comment.user.login,
            body: event.comment.body,
        }))
    }
}
