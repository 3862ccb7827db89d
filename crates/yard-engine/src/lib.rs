//! Track lifecycle engine: drives create, delete, sync, jump, and status
//! reconciliation over the registry and the external collaborators.
//!
//! Create and delete are two-phase protocols without a real transaction.
//! The ordering is load-bearing: provision before persist on create,
//! deprovision before unpersist on delete. A registry row exists if and
//! only if the engine believes the environment it describes exists.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;
use yard_core::{
    slug, CodeReviewHost, CoreError, PullRequest, RebaseOutcome, RegistryError, RemoteEnvironment,
    RemoteId, SyncOutcome, TerminalMultiplexer, Track, TrackEnvironment, TrackKind, TrackRegistry,
    TrackStatus, VcsStatus, VersionControl, STALENESS_THRESHOLD, UNKNOWN_SHA,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("branch `{branch}` is already tracked")]
    AlreadyTracked { branch: String },
    #[error("branch `{branch}` is not tracked")]
    NotTracked { branch: String },
    #[error("{operation} is not supported for {kind} tracks (branch `{branch}`)")]
    UnsupportedForKind {
        branch: String,
        operation: &'static str,
        kind: TrackKind,
    },
    #[error("fetch failed for branch `{branch}`: {source}")]
    Fetch { branch: String, source: CoreError },
    #[error("could not resolve a base branch for `{branch}`: {source}")]
    BaseResolution { branch: String, source: CoreError },
    #[error("failed to provision an environment for branch `{branch}`: {source}")]
    Provision { branch: String, source: CoreError },
    #[error("failed to persist track for branch `{branch}` (provisioned environment was removed): {source}")]
    Persist {
        branch: String,
        source: RegistryError,
    },
    #[error(
        "failed to persist track for branch `{branch}` AND compensation failed; \
         orphaned environment `{locator}` must be removed manually (persist: {persist}; cleanup: {compensation})"
    )]
    PersistCompensationFailed {
        branch: String,
        locator: String,
        persist: RegistryError,
        compensation: CoreError,
    },
    #[error("failed to deprovision the environment for branch `{branch}`; track was kept, retry delete: {source}")]
    Deprovision { branch: String, source: CoreError },
    #[error("environment for branch `{branch}` is gone but its registry row could not be removed; retry delete: {source}")]
    Unpersist {
        branch: String,
        source: RegistryError,
    },
    #[error("rebase failed for branch `{branch}`: {source}")]
    Rebase { branch: String, source: CoreError },
    #[error("push failed for branch `{branch}`; local rebase succeeded but the remote copy is behind, retry sync: {source}")]
    Push { branch: String, source: CoreError },
    #[error("multiplexer operation failed for branch `{branch}`: {source}")]
    Multiplexer { branch: String, source: CoreError },
    #[error("remote branch listing failed: {source}")]
    RemoteListing { source: CoreError },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Per-instance settings resolved from configuration at startup.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Main checkout of the source repository.
    pub repo_path: PathBuf,
    /// Canonical `owner/name` slug of the repository's remote.
    pub remote: RemoteId,
    /// Directory under which worktrees are provisioned.
    pub worktree_base: PathBuf,
    /// Multiplexer session all track windows live in.
    pub session: String,
    /// Command used to launch the coding assistant inside a track window.
    pub assistant_command: String,
}

/// A remote branch carrying one of the user's open pull requests, enriched
/// with the PR number when it is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBranchInfo {
    pub name: String,
    pub last_commit: String,
    pub age: Option<Duration>,
    pub pr_number: Option<u64>,
}

pub struct TrackEngine {
    registry: Arc<dyn TrackRegistry>,
    vcs: Arc<dyn VersionControl>,
    review: Arc<dyn CodeReviewHost>,
    remote_env: Arc<dyn RemoteEnvironment>,
    mux: Arc<dyn TerminalMultiplexer>,
    settings: EngineSettings,
}

impl TrackEngine {
    pub fn new(
        registry: Arc<dyn TrackRegistry>,
        vcs: Arc<dyn VersionControl>,
        review: Arc<dyn CodeReviewHost>,
        remote_env: Arc<dyn RemoteEnvironment>,
        mux: Arc<dyn TerminalMultiplexer>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            vcs,
            review,
            remote_env,
            mux,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn create_track(
        &self,
        branch: &str,
        kind: TrackKind,
    ) -> Result<Track, EngineError> {
        if self.registry.get(&self.settings.remote, branch)?.is_some() {
            return Err(EngineError::AlreadyTracked {
                branch: branch.to_owned(),
            });
        }

        match kind {
            TrackKind::Worktree => self.create_worktree_track(branch).await,
            TrackKind::RemoteEnv => self.create_remote_env_track(branch).await,
        }
    }

    async fn create_worktree_track(&self, branch: &str) -> Result<Track, EngineError> {
        let repo = &self.settings.repo_path;

        self.vcs
            .fetch(repo)
            .await
            .map_err(|source| EngineError::Fetch {
                branch: branch.to_owned(),
                source,
            })?;

        let default_branch =
            self.vcs
                .default_branch(repo)
                .await
                .map_err(|source| EngineError::BaseResolution {
                    branch: branch.to_owned(),
                    source,
                })?;

        let local_sha = self
            .vcs
            .branch_sha(repo, branch)
            .await
            .map_err(|source| EngineError::BaseResolution {
                branch: branch.to_owned(),
                source,
            })?;
        let remote_sha = self
            .vcs
            .branch_sha(repo, &format!("origin/{branch}"))
            .await
            .map_err(|source| EngineError::BaseResolution {
                branch: branch.to_owned(),
                source,
            })?;

        if local_sha.is_none() {
            // Prefer tracking an existing remote copy over branching fresh.
            let base = if remote_sha.is_some() {
                format!("origin/{branch}")
            } else {
                format!("origin/{default_branch}")
            };
            self.vcs
                .create_branch(repo, branch, &base)
                .await
                .map_err(|source| EngineError::Provision {
                    branch: branch.to_owned(),
                    source,
                })?;
        }

        let sha = self
            .vcs
            .branch_sha(repo, branch)
            .await
            .map_err(|source| EngineError::BaseResolution {
                branch: branch.to_owned(),
                source,
            })?
            .ok_or_else(|| EngineError::BaseResolution {
                branch: branch.to_owned(),
                source: CoreError::DependencyUnavailable(format!(
                    "branch `{branch}` did not resolve after creation"
                )),
            })?;

        let path = self
            .settings
            .worktree_base
            .join(slug::worktree_dir_name(branch, &sha));

        std::fs::create_dir_all(&self.settings.worktree_base).map_err(|error| {
            EngineError::Provision {
                branch: branch.to_owned(),
                source: CoreError::Configuration(format!(
                    "failed to create worktree base directory {}: {error}",
                    self.settings.worktree_base.display()
                )),
            }
        })?;

        self.vcs
            .add_worktree(repo, &path, branch)
            .await
            .map_err(|source| EngineError::Provision {
                branch: branch.to_owned(),
                source,
            })?;

        let now = OffsetDateTime::now_utc();
        let track = Track {
            remote: self.settings.remote.clone(),
            branch: branch.to_owned(),
            head_sha: sha,
            environment: TrackEnvironment::Worktree { path: path.clone() },
            created_at: now,
            last_accessed_at: Some(now),
        };

        if let Err(persist) = self.registry.insert(&track) {
            // Compensation: the worktree must not outlive a failed persist.
            if let Err(compensation) = self.vcs.remove_worktree(repo, &path).await {
                return Err(EngineError::PersistCompensationFailed {
                    branch: branch.to_owned(),
                    locator: path.display().to_string(),
                    persist,
                    compensation,
                });
            }
            if persist.is_duplicate_key() {
                return Err(EngineError::AlreadyTracked {
                    branch: branch.to_owned(),
                });
            }
            return Err(EngineError::Persist {
                branch: branch.to_owned(),
                source: persist,
            });
        }

        Ok(track)
    }

    async fn create_remote_env_track(&self, branch: &str) -> Result<Track, EngineError> {
        let name = slug::slugify(branch);

        let exists =
            self.remote_env
                .exists(&name)
                .await
                .map_err(|source| EngineError::Provision {
                    branch: branch.to_owned(),
                    source,
                })?;
        if exists {
            return Err(EngineError::Provision {
                branch: branch.to_owned(),
                source: CoreError::Configuration(format!(
                    "remote environment `{name}` already exists"
                )),
            });
        }

        let repo_url = format!("https://github.com/{}.git", self.settings.remote);
        self.remote_env
            .create(&name, &repo_url, branch)
            .await
            .map_err(|source| EngineError::Provision {
                branch: branch.to_owned(),
                source,
            })?;

        // The branch may not exist anywhere yet for a fresh environment, so
        // the recorded SHA is best-effort.
        if let Err(error) = self.vcs.fetch(&self.settings.repo_path).await {
            warn!(branch, %error, "fetch before SHA resolution failed");
        }
        let sha = match self
            .vcs
            .branch_sha(&self.settings.repo_path, &format!("origin/{branch}"))
            .await
        {
            Ok(Some(sha)) => sha,
            Ok(None) => UNKNOWN_SHA.to_owned(),
            Err(error) => {
                warn!(branch, %error, "could not resolve remote branch SHA");
                UNKNOWN_SHA.to_owned()
            }
        };

        let now = OffsetDateTime::now_utc();
        let track = Track {
            remote: self.settings.remote.clone(),
            branch: branch.to_owned(),
            head_sha: sha,
            environment: TrackEnvironment::RemoteEnv { name: name.clone() },
            created_at: now,
            last_accessed_at: Some(now),
        };

        if let Err(persist) = self.registry.insert(&track) {
            if let Err(compensation) = self.remote_env.delete(&name).await {
                return Err(EngineError::PersistCompensationFailed {
                    branch: branch.to_owned(),
                    locator: name,
                    persist,
                    compensation,
                });
            }
            if persist.is_duplicate_key() {
                return Err(EngineError::AlreadyTracked {
                    branch: branch.to_owned(),
                });
            }
            return Err(EngineError::Persist {
                branch: branch.to_owned(),
                source: persist,
            });
        }

        Ok(track)
    }

    pub async fn delete_track(
        &self,
        branch: &str,
        delete_remote_branch: bool,
    ) -> Result<(), EngineError> {
        let track = self.require_track(branch)?;

        match &track.environment {
            TrackEnvironment::Worktree { path } => {
                self.vcs
                    .remove_worktree(&self.settings.repo_path, path)
                    .await
                    .map_err(|source| EngineError::Deprovision {
                        branch: branch.to_owned(),
                        source,
                    })?;
                if let Err(error) = self.vcs.prune_worktrees(&self.settings.repo_path).await {
                    warn!(branch, %error, "worktree prune failed");
                }
            }
            TrackEnvironment::RemoteEnv { name } => {
                self.remote_env.delete(name).await.map_err(|source| {
                    EngineError::Deprovision {
                        branch: branch.to_owned(),
                        source,
                    }
                })?;
            }
        }

        if delete_remote_branch {
            // Best-effort; the branch may never have been pushed.
            if let Err(error) = self
                .vcs
                .delete_remote_branch(&self.settings.repo_path, branch)
                .await
            {
                warn!(branch, %error, "remote branch deletion failed");
            }
        }

        self.registry
            .delete(&self.settings.remote, branch)
            .map_err(|source| EngineError::Unpersist {
                branch: branch.to_owned(),
                source,
            })
    }

    pub async fn sync_track(&self, branch: &str) -> Result<SyncOutcome, EngineError> {
        let track = self.require_track(branch)?;
        let workdir = match track.worktree_path() {
            Some(path) => path.to_owned(),
            None => {
                return Err(EngineError::UnsupportedForKind {
                    branch: branch.to_owned(),
                    operation: "sync",
                    kind: track.kind(),
                })
            }
        };

        self.vcs
            .fetch(&workdir)
            .await
            .map_err(|source| EngineError::Fetch {
                branch: branch.to_owned(),
                source,
            })?;

        let default_branch = self
            .vcs
            .default_branch(&workdir)
            .await
            .map_err(|source| EngineError::BaseResolution {
                branch: branch.to_owned(),
                source,
            })?;

        let outcome = self
            .vcs
            .rebase_onto(&workdir, &format!("origin/{default_branch}"))
            .await
            .map_err(|source| EngineError::Rebase {
                branch: branch.to_owned(),
                source,
            })?;

        if outcome == RebaseOutcome::Conflict {
            // The worktree is left mid-rebase; resolution is manual.
            return Ok(SyncOutcome {
                conflict: true,
                conflict_path: Some(workdir),
                ..SyncOutcome::default()
            });
        }

        self.vcs
            .force_push(&workdir, branch)
            .await
            .map_err(|source| EngineError::Push {
                branch: branch.to_owned(),
                source,
            })?;

        let mut result = SyncOutcome {
            rebased: true,
            pushed: true,
            ..SyncOutcome::default()
        };

        // Everything past the push is best-effort: the rebase and push are
        // the call's contract, and a wrong SHA self-corrects on the next
        // status refresh.
        match self.vcs.head_sha(&workdir).await {
            Ok(sha) => {
                if let Err(error) =
                    self.registry
                        .update_head_sha(&self.settings.remote, branch, &sha)
                {
                    warn!(branch, %error, "head SHA update failed");
                }
            }
            Err(error) => warn!(branch, %error, "head SHA resolution failed"),
        }

        match self
            .review
            .find_pull_request(&self.settings.remote, branch)
            .await
        {
            Ok(Some(pr)) => {
                result.pr_number = Some(pr.number);
            }
            Ok(None) => {
                match self
                    .review
                    .create_pull_request(&self.settings.remote, branch, &default_branch, branch)
                    .await
                {
                    Ok(number) => {
                        result.pr_created = true;
                        result.pr_number = Some(number);
                    }
                    Err(error) => warn!(branch, %error, "pull request creation failed"),
                }
            }
            Err(error) => warn!(branch, %error, "pull request lookup failed"),
        }

        Ok(result)
    }

    pub async fn jump(&self, branch: &str) -> Result<(), EngineError> {
        let track = self.require_track(branch)?;
        self.touch(branch);

        let window = slug::window_name(branch);
        self.ensure_window(&track, branch, &window, None).await?;
        self.enter_window(branch, &window).await
    }

    pub async fn run_assistant(&self, branch: &str) -> Result<(), EngineError> {
        let track = self.require_track(branch)?;
        let workdir = match track.worktree_path() {
            Some(path) => path.to_owned(),
            None => {
                return Err(EngineError::UnsupportedForKind {
                    branch: branch.to_owned(),
                    operation: "run-assistant",
                    kind: track.kind(),
                })
            }
        };
        self.touch(branch);

        let window = slug::window_name(branch);
        let command = format!(
            "{} {}",
            self.settings.assistant_command,
            workdir.display()
        );
        self.ensure_window(&track, branch, &window, Some(&command))
            .await?;
        self.enter_window(branch, &window).await
    }

    /// Ensures the session and the track's window exist. A newly created
    /// window starts in the worktree for Worktree tracks; RemoteEnv windows
    /// get the connection command typed in so the shell lands inside the
    /// environment. `command`, when given, is run in the window either way.
    async fn ensure_window(
        &self,
        track: &Track,
        branch: &str,
        window: &str,
        command: Option<&str>,
    ) -> Result<(), EngineError> {
        let session = &self.settings.session;
        let mux_err = |source| EngineError::Multiplexer {
            branch: branch.to_owned(),
            source,
        };

        if !self.mux.session_exists(session).await.map_err(mux_err)? {
            self.mux.create_session(session).await.map_err(|source| {
                EngineError::Multiplexer {
                    branch: branch.to_owned(),
                    source,
                }
            })?;
        }

        let window_exists = self
            .mux
            .window_exists(session, window)
            .await
            .map_err(|source| EngineError::Multiplexer {
                branch: branch.to_owned(),
                source,
            })?;

        if !window_exists {
            self.mux
                .create_window(session, window, track.worktree_path())
                .await
                .map_err(|source| EngineError::Multiplexer {
                    branch: branch.to_owned(),
                    source,
                })?;

            if let TrackEnvironment::RemoteEnv { name } = &track.environment {
                match self.remote_env.connection_command(name).await {
                    Ok(connect) => {
                        if let Err(error) = self.mux.run_in_window(session, window, &connect).await
                        {
                            warn!(branch, %error, "seeding connection command failed");
                        }
                    }
                    Err(error) => warn!(branch, %error, "connection command lookup failed"),
                }
            }
        }

        if let Some(command) = command {
            self.mux
                .run_in_window(session, window, command)
                .await
                .map_err(|source| EngineError::Multiplexer {
                    branch: branch.to_owned(),
                    source,
                })?;
        }

        Ok(())
    }

    async fn enter_window(&self, branch: &str, window: &str) -> Result<(), EngineError> {
        let session = &self.settings.session;
        if self.mux.inside_multiplexer() {
            self.mux
                .switch_to_window(session, window)
                .await
                .map_err(|source| EngineError::Multiplexer {
                    branch: branch.to_owned(),
                    source,
                })
        } else {
            if let Err(error) = self.mux.select_window(session, window).await {
                warn!(branch, %error, "window selection failed");
            }
            self.mux
                .attach_session(session)
                .await
                .map_err(|source| EngineError::Multiplexer {
                    branch: branch.to_owned(),
                    source,
                })
        }
    }

    /// Best-effort aggregate of live state. Collaborator failures degrade
    /// individual fields instead of failing the call.
    pub async fn track_status(&self, track: &Track) -> TrackStatus {
        let mut status = TrackStatus::default();

        if let Some(workdir) = track.worktree_path() {
            let mut vcs = VcsStatus::default();

            match self.vcs.is_dirty(workdir).await {
                Ok(dirty) => vcs.clean = !dirty,
                Err(error) => warn!(branch = %track.branch, %error, "dirtiness probe failed"),
            }

            match self.vcs.default_branch(workdir).await {
                Ok(default_branch) => {
                    match self
                        .vcs
                        .ahead_behind(workdir, &track.branch, &format!("origin/{default_branch}"))
                        .await
                    {
                        Ok((ahead, behind)) => {
                            vcs.ahead = ahead;
                            vcs.behind = behind;
                        }
                        Err(error) => {
                            warn!(branch = %track.branch, %error, "ahead/behind probe failed")
                        }
                    }
                }
                Err(error) => {
                    warn!(branch = %track.branch, %error, "default branch resolution failed")
                }
            }

            status.vcs = Some(vcs);

            if let Ok(live_sha) = self.vcs.head_sha(workdir).await {
                if !track.head_sha.is_empty()
                    && track.head_sha != UNKNOWN_SHA
                    && live_sha != track.head_sha
                {
                    status.sha_drift = true;
                    // Opportunistic correction; drift was still reported.
                    if let Err(error) =
                        self.registry
                            .update_head_sha(&track.remote, &track.branch, &live_sha)
                    {
                        warn!(branch = %track.branch, %error, "head SHA correction failed");
                    }
                }
            }
        }

        match self
            .review
            .find_pull_request(&track.remote, &track.branch)
            .await
        {
            Ok(pr) => status.review = pr,
            Err(error) => warn!(branch = %track.branch, %error, "pull request lookup failed"),
        }

        if let Some(last_accessed) = track.last_accessed_at {
            status.stale = OffsetDateTime::now_utc() - last_accessed > STALENESS_THRESHOLD;
        }

        status
    }

    pub async fn list_with_status(&self) -> Result<Vec<(Track, TrackStatus)>, EngineError> {
        let tracks = self.registry.list(&self.settings.remote)?;
        let mut result = Vec::with_capacity(tracks.len());
        for track in tracks {
            let status = self.track_status(&track).await;
            result.push((track, status));
        }
        Ok(result)
    }

    pub async fn list_remote_branches(&self) -> Result<Vec<RemoteBranchInfo>, EngineError> {
        let branches = self
            .review
            .branches_with_my_open_pull_requests(&self.settings.remote)
            .await
            .map_err(|source| EngineError::RemoteListing { source })?;

        let prs: Vec<PullRequest> = match self
            .review
            .list_my_open_pull_requests(&self.settings.remote)
            .await
        {
            Ok(prs) => prs,
            Err(error) => {
                warn!(%error, "pull request enrichment failed");
                Vec::new()
            }
        };

        Ok(branches
            .into_iter()
            .map(|branch| {
                let pr_number = prs
                    .iter()
                    .find(|pr| pr.branch == branch.name)
                    .map(|pr| pr.number);
                RemoteBranchInfo {
                    name: branch.name,
                    last_commit: branch.last_commit,
                    age: branch.age,
                    pr_number,
                }
            })
            .collect())
    }

    fn require_track(&self, branch: &str) -> Result<Track, EngineError> {
        self.registry
            .get(&self.settings.remote, branch)?
            .ok_or_else(|| EngineError::NotTracked {
                branch: branch.to_owned(),
            })
    }

    fn touch(&self, branch: &str) {
        if let Err(error) =
            self.registry
                .touch_last_accessed(&self.settings.remote, branch, OffsetDateTime::now_utc())
        {
            warn!(branch, %error, "last-accessed update failed");
        }
    }
}
