//! Fact Extractor: raw delivery → normalised [`FactBundle`].
//!
//! Pure and side-effect free. Every required field is checked here so that
//! nothing downstream has to cope with a half-formed event; a missing or
//! invalid field yields a [`MalformedEvent`] naming the field.

use serde::{Deserialize, Serialize};

use crate::{
    CommitSha, Delivery, DeliveryId, EventKind, FilePath, GitRef, Login, MalformedEvent, PolicyId,
    PullRequestNumber, ReleaseTag, RepositoryName, RunKey, SubjectKey, Timestamp,
};

// ---------------------------------------------------------------------------
// Fact bundle
// ---------------------------------------------------------------------------

/// Normalised, validated facts about one delivery. The working state a run
/// carries from step to step (and persists at every checkpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactBundle {
    /// Delivery these facts came from.
    pub delivery_id: DeliveryId,
    /// Repository the event refers to.
    pub repository: RepositoryFacts,
    /// What happened.
    pub subject: Subject,
    /// When the delivery was received (start of the freshness clock).
    pub received_at: Timestamp,
}

/// Repository identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryFacts {
    /// `"owner/repo"`.
    pub name: RepositoryName,
    /// Owning account.
    pub owner: Login,
}

/// Subject-specific facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    /// A pull request event.
    PullRequest(PullRequestFacts),
    /// A push event.
    Push(PushFacts),
    /// A release event.
    Release(ReleaseFacts),
}

/// Pull request action as delivered by GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    /// PR created.
    Opened,
    /// PR reopened after close.
    Reopened,
    /// New commits pushed to the head branch.
    Synchronize,
    /// Title or body edited.
    Edited,
    /// Label added.
    Labeled,
    /// Label removed.
    Unlabeled,
    /// Draft marked ready.
    ReadyForReview,
    /// Closed (merged or not; see [`PullRequestState`]).
    Closed,
}

impl PullRequestAction {
    fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "opened" => Self::Opened,
            "reopened" => Self::Reopened,
            "synchronize" => Self::Synchronize,
            "edited" => Self::Edited,
            "labeled" => Self::Labeled,
            "unlabeled" => Self::Unlabeled,
            "ready_for_review" => Self::ReadyForReview,
            "closed" => Self::Closed,
            _ => return None,
        })
    }
}

/// Lifecycle state of a pull request. `Closed` and `Merged` are final but
/// the entity is never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    /// Open for review.
    Open,
    /// Closed without merging.
    Closed,
    /// Merged.
    Merged,
}

impl PullRequestState {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            PullRequestState::Open => "open",
            PullRequestState::Closed => "closed",
            PullRequestState::Merged => "merged",
        }
    }
}

/// Change status of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// New file.
    Added,
    /// Changed in place.
    Modified,
    /// Deleted; its graph entities are marked stale.
    Removed,
    /// Moved (the path is the new location).
    Renamed,
}

/// One changed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedFile {
    /// Path relative to the repository root.
    pub path: FilePath,
    /// Change status.
    pub status: FileStatus,
}

/// Pull request facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestFacts {
    /// Number, unique per repository.
    pub number: PullRequestNumber,
    /// What happened to the PR.
    pub action: PullRequestAction,
    /// PR title.
    pub title: String,
    /// PR author.
    pub author: Login,
    /// Current state.
    pub state: PullRequestState,
    /// Head commit, when provided.
    pub head_sha: Option<CommitSha>,
    /// Number of changed files reported by GitHub.
    pub changed_file_count: u32,
    /// Lines added.
    pub additions: u64,
    /// Lines deleted.
    pub deletions: u64,
    /// Label names.
    pub labels: Vec<String>,
    /// Per-file changes, when the intake precomputed them.
    pub files: Vec<ChangedFile>,
    /// Policies that govern this PR, when the intake attached them.
    pub policies: Vec<PolicyId>,
    /// PR creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
    /// PR body, trimmed.
    pub summary: String,
}

/// Push facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFacts {
    /// Pushed ref.
    pub git_ref: GitRef,
    /// New head of the ref.
    pub head_sha: CommitSha,
    /// Who pushed.
    pub pusher: Login,
    /// Files touched by the pushed commits (last status wins per path).
    pub files: Vec<ChangedFile>,
    /// Head commit time, or receipt time when absent.
    pub pushed_at: Timestamp,
}

/// Release facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseFacts {
    /// Release tag.
    pub tag: ReleaseTag,
    /// Display name (defaults to the tag).
    pub name: String,
    /// Release author.
    pub author: Login,
    /// Release notes.
    pub body: String,
    /// Publication time, or creation time when unpublished.
    pub published_at: Timestamp,
}

impl FactBundle {
    /// The run key for these facts.
    pub fn run_key(&self) -> RunKey {
        let subject = match &self.subject {
            Subject::PullRequest(pr) => SubjectKey::PullRequest(pr.number),
            Subject::Push(push) => SubjectKey::Ref(push.git_ref.clone()),
            Subject::Release(rel) => SubjectKey::Release(rel.tag.clone()),
        };
        RunKey {
            repository: self.repository.name.clone(),
            subject,
        }
    }

    /// Commit to analyse, if the subject has one.
    pub fn head_sha(&self) -> Option<&CommitSha> {
        match &self.subject {
            Subject::PullRequest(pr) => pr.head_sha.as_ref(),
            Subject::Push(push) => Some(&push.head_sha),
            Subject::Release(_) => None,
        }
    }

    /// Changed files, empty for releases.
    pub fn changed_files(&self) -> &[ChangedFile] {
        match &self.subject {
            Subject::PullRequest(pr) => &pr.files,
            Subject::Push(push) => &push.files,
            Subject::Release(_) => &[],
        }
    }

    /// The pull request facts, if this is a PR event.
    pub fn pull_request(&self) -> Option<&PullRequestFacts> {
        match &self.subject {
            Subject::PullRequest(pr) => Some(pr),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw payload shapes (only the fields we read)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawAccount {
    login: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRepository {
    full_name: Option<String>,
    owner: Option<RawAccount>,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawHead {
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    number: Option<u64>,
    title: Option<String>,
    user: Option<RawAccount>,
    state: Option<String>,
    #[serde(default)]
    merged: bool,
    head: Option<RawHead>,
    changed_files: Option<u32>,
    additions: Option<u64>,
    deletions: Option<u64>,
    #[serde(default)]
    labels: Vec<RawLabel>,
    created_at: Option<String>,
    updated_at: Option<String>,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    path: String,
    status: FileStatus,
}

#[derive(Debug, Deserialize)]
struct RawPullRequestEvent {
    action: Option<String>,
    pull_request: Option<RawPullRequest>,
    #[serde(default)]
    files: Vec<RawFile>,
    #[serde(default)]
    policies: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCommit {
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    modified: Vec<String>,
    #[serde(default)]
    removed: Vec<String>,
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPushEvent {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    after: Option<String>,
    pusher: Option<RawAccount>,
    sender: Option<RawAccount>,
    #[serde(default)]
    commits: Vec<RawCommit>,
    head_commit: Option<RawCommit>,
}

#[derive(Debug, Deserialize)]
struct RawRelease {
    tag_name: Option<String>,
    name: Option<String>,
    author: Option<RawAccount>,
    body: Option<String>,
    published_at: Option<String>,
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReleaseEvent {
    release: Option<RawRelease>,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

fn decode<T: serde::de::DeserializeOwned>(delivery: &Delivery) -> Result<T, MalformedEvent> {
    serde_json::from_value(delivery.payload.clone())
        .map_err(|e| MalformedEvent::invalid("payload", e.to_string()))
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, MalformedEvent> {
    value.ok_or_else(|| MalformedEvent::missing(field))
}

fn required_id<T>(
    value: Option<String>,
    field: &str,
    ctor: impl FnOnce(String) -> Option<T>,
) -> Result<T, MalformedEvent> {
    ctor(required(value, field)?).ok_or_else(|| MalformedEvent::invalid(field, "must not be empty"))
}

fn required_time(value: Option<String>, field: &str) -> Result<Timestamp, MalformedEvent> {
    let raw = required(value, field)?;
    Timestamp::parse_rfc3339(&raw)
        .ok_or_else(|| MalformedEvent::invalid(field, format!("'{raw}' is not an RFC 3339 timestamp")))
}

fn raw_repository(delivery: &Delivery) -> Result<RawRepository, MalformedEvent> {
    let repo = delivery
        .payload
        .get("repository")
        .ok_or_else(|| MalformedEvent::missing("repository"))?;
    serde_json::from_value(repo.clone())
        .map_err(|e| MalformedEvent::invalid("repository", e.to_string()))
}

fn repository_name(delivery: &Delivery) -> Result<RepositoryName, MalformedEvent> {
    required_id(
        raw_repository(delivery)?.full_name,
        "repository.full_name",
        RepositoryName::new,
    )
}

fn repository_facts(delivery: &Delivery) -> Result<RepositoryFacts, MalformedEvent> {
    let repo = raw_repository(delivery)?;
    let owner_login = repo.owner.and_then(|owner| owner.login);
    let name = required_id(repo.full_name, "repository.full_name", RepositoryName::new)?;
    // Fall back to the owner segment of the full name.
    let owner = owner_login
        .and_then(Login::new)
        .or_else(|| Login::new(name.owner()))
        .ok_or_else(|| MalformedEvent::missing("repository.owner.login"))?;
    Ok(RepositoryFacts { name, owner })
}

/// Derives the run key without extracting the full bundle.
///
/// Used at intake, before the delivery is registered, so that runs can be
/// serialised per key. A delivery without a derivable key is malformed and
/// is never registered.
pub fn derive_run_key(delivery: &Delivery) -> Result<RunKey, MalformedEvent> {
    let repository = repository_name(delivery)?;
    let subject = match delivery.kind()? {
        EventKind::PullRequest => {
            let number = delivery
                .payload
                .pointer("/pull_request/number")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| MalformedEvent::missing("pull_request.number"))?;
            SubjectKey::PullRequest(PullRequestNumber::new(number))
        }
        EventKind::Push => {
            let git_ref = delivery.payload.get("ref").and_then(|v| v.as_str());
            SubjectKey::Ref(
                git_ref
                    .and_then(GitRef::new)
                    .ok_or_else(|| MalformedEvent::missing("ref"))?,
            )
        }
        EventKind::Release => {
            let tag = delivery.payload.pointer("/release/tag_name").and_then(|v| v.as_str());
            SubjectKey::Release(
                tag.and_then(ReleaseTag::new)
                    .ok_or_else(|| MalformedEvent::missing("release.tag_name"))?,
            )
        }
    };
    Ok(RunKey {
        repository,
        subject,
    })
}

/// Extracts a validated [`FactBundle`] from a raw delivery.
pub fn extract_facts(delivery: &Delivery) -> Result<FactBundle, MalformedEvent> {
    let repository = repository_facts(delivery)?;
    let subject = match delivery.kind()? {
        EventKind::PullRequest => Subject::PullRequest(extract_pull_request(delivery)?),
        EventKind::Push => Subject::Push(extract_push(delivery)?),
        EventKind::Release => Subject::Release(extract_release(delivery)?),
    };
    Ok(FactBundle {
        delivery_id: delivery.delivery_id.clone(),
        repository,
        subject,
        received_at: delivery.received_at,
    })
}

fn extract_pull_request(delivery: &Delivery) -> Result<PullRequestFacts, MalformedEvent> {
    let event: RawPullRequestEvent = decode(delivery)?;
    let action_raw = required(event.action, "action")?;
    let action = PullRequestAction::parse(&action_raw)
        .ok_or_else(|| MalformedEvent::invalid("action", format!("'{action_raw}' is not a pull request action")))?;
    let pr = required(event.pull_request, "pull_request")?;

    let number = PullRequestNumber::new(required(pr.number, "pull_request.number")?);
    let title = required(pr.title, "pull_request.title")?;
    let author = required_id(
        pr.user.unwrap_or_default().login,
        "pull_request.user.login",
        Login::new,
    )?;
    let state_raw = required(pr.state, "pull_request.state")?;
    let state = match (state_raw.as_str(), pr.merged) {
        ("open", _) => PullRequestState::Open,
        ("closed", true) => PullRequestState::Merged,
        ("closed", false) => PullRequestState::Closed,
        (other, _) => {
            return Err(MalformedEvent::invalid(
                "pull_request.state",
                format!("'{other}' is not open or closed"),
            ))
        }
    };
    let head_sha = pr.head.and_then(|h| h.sha).and_then(CommitSha::new);

    let files = event
        .files
        .into_iter()
        .map(|f| {
            FilePath::new(f.path)
                .map(|path| ChangedFile {
                    path,
                    status: f.status,
                })
                .ok_or_else(|| MalformedEvent::invalid("files.path", "must not be empty"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PullRequestFacts {
        number,
        action,
        title,
        author,
        state,
        head_sha,
        changed_file_count: required(pr.changed_files, "pull_request.changed_files")?,
        additions: required(pr.additions, "pull_request.additions")?,
        deletions: required(pr.deletions, "pull_request.deletions")?,
        labels: pr.labels.into_iter().map(|l| l.name).collect(),
        files,
        policies: event.policies.into_iter().filter_map(PolicyId::new).collect(),
        created_at: required_time(pr.created_at, "pull_request.created_at")?,
        updated_at: required_time(pr.updated_at, "pull_request.updated_at")?,
        summary: pr.body.unwrap_or_default().trim().to_string(),
    })
}

fn extract_push(delivery: &Delivery) -> Result<PushFacts, MalformedEvent> {
    let event: RawPushEvent = decode(delivery)?;
    let git_ref = required_id(event.git_ref, "ref", GitRef::new)?;
    let head_sha = required_id(event.after, "after", CommitSha::new)?;
    let pusher = event
        .pusher
        .and_then(|p| p.name.or(p.login))
        .or_else(|| event.sender.and_then(|s| s.login))
        .and_then(Login::new)
        .ok_or_else(|| MalformedEvent::missing("pusher.name"))?;

    // Later commits override earlier statuses for the same path.
    let mut by_path: Vec<ChangedFile> = Vec::new();
    let mut record = |path: String, status: FileStatus| {
        if let Some(path) = FilePath::new(path) {
            match by_path.iter_mut().find(|f| f.path == path) {
                Some(existing) => existing.status = status,
                None => by_path.push(ChangedFile { path, status }),
            }
        }
    };
    for commit in &event.commits {
        commit.added.iter().for_each(|p| record(p.clone(), FileStatus::Added));
        commit.modified.iter().for_each(|p| record(p.clone(), FileStatus::Modified));
        commit.removed.iter().for_each(|p| record(p.clone(), FileStatus::Removed));
    }

    let pushed_at = event
        .head_commit
        .and_then(|c| c.timestamp)
        .and_then(|t| Timestamp::parse_rfc3339(&t))
        .unwrap_or(delivery.received_at);

    Ok(PushFacts {
        git_ref,
        head_sha,
        pusher,
        files: by_path,
        pushed_at,
    })
}

fn extract_release(delivery: &Delivery) -> Result<ReleaseFacts, MalformedEvent> {
    let event: RawReleaseEvent = decode(delivery)?;
    let release = required(event.release, "release")?;
    let tag = required_id(release.tag_name, "release.tag_name", ReleaseTag::new)?;
    let author = required_id(
        release.author.unwrap_or_default().login,
        "release.author.login",
        Login::new,
    )?;
    let published_at = match release.published_at {
        Some(raw) => required_time(Some(raw), "release.published_at")?,
        None => required_time(release.created_at, "release.created_at")?,
    };
    Ok(ReleaseFacts {
        name: release
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| tag.to_string()),
        tag,
        author,
        body: release.body.unwrap_or_default(),
        published_at,
    })
}
