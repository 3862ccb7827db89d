use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub mod slug;
pub mod store;

pub use store::{RegistryError, SqliteTrackRegistry, TrackRegistry};

/// A track not jumped to within this window is flagged stale during status
/// reconciliation. Hygiene signal only; nothing is deleted automatically.
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Recorded head SHA for tracks whose branch could not be resolved at
/// creation time (remote environments created before the first push).
pub const UNKNOWN_SHA: &str = "unknown";

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(RemoteId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Worktree,
    RemoteEnv,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worktree => f.write_str("worktree"),
            Self::RemoteEnv => f.write_str("remote-env"),
        }
    }
}

/// The provisioned environment a track is bound to. Each kind carries exactly
/// its own locator, so a worktree track cannot hold an environment name and
/// a remote-env track cannot hold a filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEnvironment {
    Worktree { path: PathBuf },
    RemoteEnv { name: String },
}

impl TrackEnvironment {
    pub fn kind(&self) -> TrackKind {
        match self {
            Self::Worktree { .. } => TrackKind::Worktree,
            Self::RemoteEnv { .. } => TrackKind::RemoteEnv,
        }
    }

    /// Kind-specific locator as an opaque string: the worktree path or the
    /// remote environment name.
    pub fn locator(&self) -> String {
        match self {
            Self::Worktree { path } => path.display().to_string(),
            Self::RemoteEnv { name } => name.clone(),
        }
    }
}

/// A persisted binding between a branch and one externally-provisioned
/// working environment. A row exists in the registry if and only if the
/// engine believes the corresponding environment exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub remote: RemoteId,
    pub branch: String,
    pub head_sha: String,
    pub environment: TrackEnvironment,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: Option<OffsetDateTime>,
}

impl Track {
    pub fn kind(&self) -> TrackKind {
        self.environment.kind()
    }

    pub fn worktree_path(&self) -> Option<&Path> {
        match &self.environment {
            TrackEnvironment::Worktree { path } => Some(path),
            TrackEnvironment::RemoteEnv { .. } => None,
        }
    }
}

/// Working-copy state relative to the source repository's default branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VcsStatus {
    pub clean: bool,
    pub ahead: u32,
    pub behind: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullRequestState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiState {
    Passing,
    Pending,
    Failing,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Pending,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub branch: String,
    pub state: PullRequestState,
    pub ci: CiState,
    pub review: ReviewState,
}

/// A remote branch carrying one of the current user's open pull requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBranchSummary {
    pub name: String,
    pub last_commit: String,
    pub age: Option<Duration>,
}

/// Live, non-persisted view of a track, merged from version control and the
/// code-review host on demand. `vcs` is absent for remote-env tracks (no
/// local working copy to inspect); `review` is absent when no pull request
/// exists or the host is unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackStatus {
    pub vcs: Option<VcsStatus>,
    pub sha_drift: bool,
    pub review: Option<PullRequest>,
    pub stale: bool,
}

/// Result of one sync invocation. A conflict is a normal outcome, not an
/// error: the worktree is left mid-rebase at `conflict_path` for manual
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncOutcome {
    pub rebased: bool,
    pub pushed: bool,
    pub pr_created: bool,
    pub pr_number: Option<u64>,
    pub conflict: bool,
    pub conflict_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    Conflict,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Branch, worktree, and history operations against the source repository.
/// `workdir` is the directory the underlying command runs in: the main
/// checkout for branch management, a worktree for sync and status probes.
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn fetch(&self, workdir: &Path) -> Result<(), CoreError>;

    /// Name of the remote's default branch (without the `origin/` prefix).
    async fn default_branch(&self, workdir: &Path) -> Result<String, CoreError>;

    async fn create_branch(
        &self,
        workdir: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), CoreError>;

    /// SHA of a local or remote-tracking ref, or `None` when it does not
    /// resolve.
    async fn branch_sha(&self, workdir: &Path, reference: &str)
        -> Result<Option<String>, CoreError>;

    async fn add_worktree(&self, workdir: &Path, path: &Path, branch: &str)
        -> Result<(), CoreError>;

    async fn remove_worktree(&self, workdir: &Path, path: &Path) -> Result<(), CoreError>;

    async fn prune_worktrees(&self, workdir: &Path) -> Result<(), CoreError>;

    /// Rebase the current branch onto `onto`. Conflicts are reported as a
    /// structured outcome with the rebase left in progress; hard tooling
    /// failures are errors.
    async fn rebase_onto(&self, workdir: &Path, onto: &str) -> Result<RebaseOutcome, CoreError>;

    async fn push(&self, workdir: &Path, branch: &str) -> Result<(), CoreError>;

    /// Force push with lease, for rewritten history after a rebase.
    async fn force_push(&self, workdir: &Path, branch: &str) -> Result<(), CoreError>;

    async fn delete_remote_branch(&self, workdir: &Path, branch: &str) -> Result<(), CoreError>;

    /// Commits on `branch` not on `base`, and vice versa.
    async fn ahead_behind(
        &self,
        workdir: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(u32, u32), CoreError>;

    async fn head_sha(&self, workdir: &Path) -> Result<String, CoreError>;

    async fn is_dirty(&self, workdir: &Path) -> Result<bool, CoreError>;
}

/// Pull-request discovery, creation, and status on the code-review host.
#[async_trait]
pub trait CodeReviewHost: Send + Sync {
    async fn default_branch(&self, remote: &RemoteId) -> Result<String, CoreError>;

    async fn current_user(&self) -> Result<String, CoreError>;

    async fn find_pull_request(
        &self,
        remote: &RemoteId,
        branch: &str,
    ) -> Result<Option<PullRequest>, CoreError>;

    async fn create_pull_request(
        &self,
        remote: &RemoteId,
        branch: &str,
        base: &str,
        title: &str,
    ) -> Result<u64, CoreError>;

    async fn list_my_open_pull_requests(
        &self,
        remote: &RemoteId,
    ) -> Result<Vec<PullRequest>, CoreError>;

    async fn branches_with_my_open_pull_requests(
        &self,
        remote: &RemoteId,
    ) -> Result<Vec<RemoteBranchSummary>, CoreError>;
}

/// Lifecycle of remotely-provisioned development environments.
#[async_trait]
pub trait RemoteEnvironment: Send + Sync {
    async fn create(&self, name: &str, repo_url: &str, branch: &str) -> Result<(), CoreError>;

    async fn delete(&self, name: &str) -> Result<(), CoreError>;

    async fn exists(&self, name: &str) -> Result<bool, CoreError>;

    /// Command string that connects an interactive shell to the environment,
    /// suitable for seeding a multiplexer window.
    async fn connection_command(&self, name: &str) -> Result<String, CoreError>;

    async fn status(&self, name: &str) -> Result<Option<String>, CoreError>;
}

/// Session and window presence in the terminal multiplexer, plus attaching
/// or switching the caller into a window.
#[async_trait]
pub trait TerminalMultiplexer: Send + Sync {
    async fn session_exists(&self, name: &str) -> Result<bool, CoreError>;

    async fn create_session(&self, name: &str) -> Result<(), CoreError>;

    async fn window_exists(&self, session: &str, window: &str) -> Result<bool, CoreError>;

    async fn create_window(
        &self,
        session: &str,
        window: &str,
        start_dir: Option<&Path>,
    ) -> Result<(), CoreError>;

    async fn run_in_window(
        &self,
        session: &str,
        window: &str,
        command: &str,
    ) -> Result<(), CoreError>;

    /// Switch the current client to a window. Only valid when the caller is
    /// already inside the multiplexer.
    async fn switch_to_window(&self, session: &str, window: &str) -> Result<(), CoreError>;

    async fn select_window(&self, session: &str, window: &str) -> Result<(), CoreError>;

    /// Attach to a session. Only valid when the caller is outside the
    /// multiplexer; mutually exclusive with `switch_to_window`.
    async fn attach_session(&self, session: &str) -> Result<(), CoreError>;

    fn inside_multiplexer(&self) -> bool;
}
