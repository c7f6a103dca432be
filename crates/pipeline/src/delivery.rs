//! Inbound delivery envelope, event kinds, and the per-subject run key.
//!
//! A [`Delivery`] is what the upstream transport hands us: an opaque unique
//! id, an event name, and a JSON payload. Nothing about the payload is
//! trusted until [`crate::facts::extract_facts`] has validated it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{DeliveryId, GitRef, MalformedEvent, PullRequestNumber, ReleaseTag, RepositoryName, Timestamp};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One delivery from the upstream at-least-once transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Transport-assigned id used for deduplication.
    pub delivery_id: DeliveryId,
    /// Event name (`"pull_request"`, `"push"`, `"release"`).
    pub event: String,
    /// When this process received the delivery.
    pub received_at: Timestamp,
    /// Raw webhook payload.
    pub payload: serde_json::Value,
}

impl Delivery {
    /// Creates a delivery stamped with the current time.
    pub fn new(delivery_id: DeliveryId, event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            delivery_id,
            event: event.into(),
            received_at: Timestamp::now(),
            payload,
        }
    }

    /// Parses the event name into an [`EventKind`].
    pub fn kind(&self) -> Result<EventKind, MalformedEvent> {
        EventKind::parse(&self.event)
    }

    /// The payload's `action` field, if any (`push` events have none).
    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(|a| a.as_str())
    }
}

// ---------------------------------------------------------------------------

/// Event kinds the pipeline ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Pull request lifecycle events.
    PullRequest,
    /// Branch or tag pushes.
    Push,
    /// Release publication.
    Release,
}

impl EventKind {
    /// Parses a GitHub event name.
    pub fn parse(event: &str) -> Result<Self, MalformedEvent> {
        match event {
            "pull_request" => Ok(EventKind::PullRequest),
            "push" => Ok(EventKind::Push),
            "release" => Ok(EventKind::Release),
            other => Err(MalformedEvent::invalid(
                "event",
                format!("'{other}' is not a supported event kind"),
            )),
        }
    }

    /// The GitHub event name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PullRequest => "pull_request",
            EventKind::Push => "push",
            EventKind::Release => "release",
        }
    }
}

// ---------------------------------------------------------------------------
// Run key
// ---------------------------------------------------------------------------

/// The entity a run is about, within its repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SubjectKey {
    /// A pull request, by number.
    PullRequest(PullRequestNumber),
    /// A pushed ref.
    Ref(GitRef),
    /// A release, by tag.
    Release(ReleaseTag),
}

/// Natural key used to serialise runs: two runs with equal keys never execute
/// concurrently, and a newer run supersedes an older in-flight one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    /// Repository the subject lives in.
    pub repository: RepositoryName,
    /// Subject within the repository.
    pub subject: SubjectKey,
}

impl RunKey {
    /// Key for a pull request run.
    pub fn pull_request(repository: RepositoryName, number: PullRequestNumber) -> Self {
        Self {
            repository,
            subject: SubjectKey::PullRequest(number),
        }
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.subject {
            SubjectKey::PullRequest(n) => write!(f, "{}#{}", self.repository, n),
            SubjectKey::Ref(r) => write!(f, "{}@{}", self.repository, r),
            SubjectKey::Release(t) => write!(f, "{}!{}", self.repository, t),
        }
    }
}

// ---------------------------------------------------------------------------
// Event source port
// ---------------------------------------------------------------------------

/// A stream of inbound deliveries (webhook receiver, queue consumer, file replay).
///
/// Returns `None` when the source is exhausted or shut down. An `Err` item is
/// a delivery that could not even be framed as an envelope; the caller logs
/// it and carries on.
#[async_trait]
pub trait EventSource: Send {
    /// Waits for the next delivery.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, MalformedEvent>>;
}
