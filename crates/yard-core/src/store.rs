//! Persisted track registry backed by sqlite. One row per `(remote, branch)`
//! pair; the composite primary key is the backstop for concurrent creators,
//! surfacing as [`RegistryError::DuplicateKey`] for the loser.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::{RemoteId, Track, TrackEnvironment};

const KIND_WORKTREE: &str = "worktree";
const KIND_REMOTE_ENV: &str = "remote-env";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a track already exists for {remote}/{branch}")]
    DuplicateKey { remote: String, branch: String },
    #[error("no track recorded for {remote}/{branch}")]
    NotFound { remote: String, branch: String },
    #[error("registry error: {0}")]
    Storage(String),
}

impl RegistryError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

pub trait TrackRegistry: Send + Sync {
    /// Fails with [`RegistryError::DuplicateKey`] when a track already
    /// exists for the same `(remote, branch)`.
    fn insert(&self, track: &Track) -> Result<(), RegistryError>;

    fn update(&self, track: &Track) -> Result<(), RegistryError>;

    fn delete(&self, remote: &RemoteId, branch: &str) -> Result<(), RegistryError>;

    fn get(&self, remote: &RemoteId, branch: &str) -> Result<Option<Track>, RegistryError>;

    /// Tracks for one remote, most recently accessed first; never-accessed
    /// tracks sort last by creation time.
    fn list(&self, remote: &RemoteId) -> Result<Vec<Track>, RegistryError>;

    fn touch_last_accessed(
        &self,
        remote: &RemoteId,
        branch: &str,
        at: OffsetDateTime,
    ) -> Result<(), RegistryError>;

    fn update_head_sha(
        &self,
        remote: &RemoteId,
        branch: &str,
        sha: &str,
    ) -> Result<(), RegistryError>;
}

pub struct SqliteTrackRegistry {
    conn: Mutex<Connection>,
}

impl SqliteTrackRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(|err| RegistryError::Storage(err.to_string()))?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    pub fn in_memory() -> Result<Self, RegistryError> {
        let conn =
            Connection::open_in_memory().map_err(|err| RegistryError::Storage(err.to_string()))?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    fn init_schema(&self) -> Result<(), RegistryError> {
        self.lock()?
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tracks (
                    remote TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    head_sha TEXT NOT NULL,
                    kind TEXT NOT NULL CHECK (kind IN ('worktree', 'remote-env')),
                    locator TEXT NOT NULL CHECK (locator <> ''),
                    created_at TEXT NOT NULL,
                    last_accessed_at TEXT NULL,
                    PRIMARY KEY (remote, branch)
                );
                ",
            )
            .map_err(|err| RegistryError::Storage(err.to_string()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RegistryError> {
        self.conn
            .lock()
            .map_err(|_| RegistryError::Storage("registry lock poisoned".to_owned()))
    }

    fn require_row_touched(
        affected: usize,
        remote: &RemoteId,
        branch: &str,
    ) -> Result<(), RegistryError> {
        if affected == 0 {
            return Err(RegistryError::NotFound {
                remote: remote.as_str().to_owned(),
                branch: branch.to_owned(),
            });
        }
        Ok(())
    }

    fn map_row(row: &rusqlite::Row<'_>) -> Result<Track, RegistryError> {
        let remote: String = row
            .get(0)
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        let branch: String = row
            .get(1)
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        let head_sha: String = row
            .get(2)
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        let kind: String = row
            .get(3)
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        let locator: String = row
            .get(4)
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        let created_at: String = row
            .get(5)
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        let last_accessed_at: Option<String> = row
            .get(6)
            .map_err(|err| RegistryError::Storage(err.to_string()))?;

        let environment = match kind.as_str() {
            KIND_WORKTREE => TrackEnvironment::Worktree {
                path: PathBuf::from(locator),
            },
            KIND_REMOTE_ENV => TrackEnvironment::RemoteEnv { name: locator },
            other => {
                return Err(RegistryError::Storage(format!(
                    "unknown track kind '{other}' in registry row for {remote}/{branch}"
                )))
            }
        };

        Ok(Track {
            remote: RemoteId::from(remote),
            branch,
            head_sha,
            environment,
            created_at: parse_timestamp(&created_at)?,
            last_accessed_at: last_accessed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

fn kind_column(environment: &TrackEnvironment) -> &'static str {
    match environment {
        TrackEnvironment::Worktree { .. } => KIND_WORKTREE,
        TrackEnvironment::RemoteEnv { .. } => KIND_REMOTE_ENV,
    }
}

fn format_timestamp(value: OffsetDateTime) -> Result<String, RegistryError> {
    value
        .format(&Rfc3339)
        .map_err(|err| RegistryError::Storage(err.to_string()))
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, RegistryError> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| {
        RegistryError::Storage(format!("invalid timestamp '{raw}' in registry: {err}"))
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    // Only key collisions count; other constraint failures (CHECK, NOT NULL)
    // must not masquerade as an already-tracked branch.
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl TrackRegistry for SqliteTrackRegistry {
    fn insert(&self, track: &Track) -> Result<(), RegistryError> {
        let created_at = format_timestamp(track.created_at)?;
        let last_accessed_at = track.last_accessed_at.map(format_timestamp).transpose()?;

        self.lock()?
            .execute(
                "
                INSERT INTO tracks (remote, branch, head_sha, kind, locator, created_at, last_accessed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    track.remote.as_str(),
                    track.branch,
                    track.head_sha,
                    kind_column(&track.environment),
                    track.environment.locator(),
                    created_at,
                    last_accessed_at,
                ],
            )
            .map_err(|err| {
                if is_unique_violation(&err) {
                    RegistryError::DuplicateKey {
                        remote: track.remote.as_str().to_owned(),
                        branch: track.branch.clone(),
                    }
                } else {
                    RegistryError::Storage(err.to_string())
                }
            })?;
        Ok(())
    }

    fn update(&self, track: &Track) -> Result<(), RegistryError> {
        let last_accessed_at = track.last_accessed_at.map(format_timestamp).transpose()?;

        let affected = self
            .lock()?
            .execute(
                "
                UPDATE tracks
                SET head_sha = ?1, kind = ?2, locator = ?3, last_accessed_at = ?4
                WHERE remote = ?5 AND branch = ?6
                ",
                params![
                    track.head_sha,
                    kind_column(&track.environment),
                    track.environment.locator(),
                    last_accessed_at,
                    track.remote.as_str(),
                    track.branch,
                ],
            )
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        Self::require_row_touched(affected, &track.remote, &track.branch)
    }

    fn delete(&self, remote: &RemoteId, branch: &str) -> Result<(), RegistryError> {
        let affected = self
            .lock()?
            .execute(
                "DELETE FROM tracks WHERE remote = ?1 AND branch = ?2",
                params![remote.as_str(), branch],
            )
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        Self::require_row_touched(affected, remote, branch)
    }

    fn get(&self, remote: &RemoteId, branch: &str) -> Result<Option<Track>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "
                SELECT remote, branch, head_sha, kind, locator, created_at, last_accessed_at
                FROM tracks
                WHERE remote = ?1 AND branch = ?2
                ",
            )
            .map_err(|err| RegistryError::Storage(err.to_string()))?;

        stmt.query_row(params![remote.as_str(), branch], |row| {
            Ok(Self::map_row(row))
        })
        .optional()
        .map_err(|err| RegistryError::Storage(err.to_string()))?
        .transpose()
    }

    fn list(&self, remote: &RemoteId) -> Result<Vec<Track>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "
                SELECT remote, branch, head_sha, kind, locator, created_at, last_accessed_at
                FROM tracks
                WHERE remote = ?1
                ORDER BY last_accessed_at IS NULL, last_accessed_at DESC, created_at DESC
                ",
            )
            .map_err(|err| RegistryError::Storage(err.to_string()))?;

        let rows = stmt
            .query_map(params![remote.as_str()], |row| Ok(Self::map_row(row)))
            .map_err(|err| RegistryError::Storage(err.to_string()))?;

        let mut tracks = Vec::new();
        for row in rows {
            tracks.push(row.map_err(|err| RegistryError::Storage(err.to_string()))??);
        }
        Ok(tracks)
    }

    fn touch_last_accessed(
        &self,
        remote: &RemoteId,
        branch: &str,
        at: OffsetDateTime,
    ) -> Result<(), RegistryError> {
        let at = format_timestamp(at)?;
        let affected = self
            .lock()?
            .execute(
                "UPDATE tracks SET last_accessed_at = ?1 WHERE remote = ?2 AND branch = ?3",
                params![at, remote.as_str(), branch],
            )
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        Self::require_row_touched(affected, remote, branch)
    }

    fn update_head_sha(
        &self,
        remote: &RemoteId,
        branch: &str,
        sha: &str,
    ) -> Result<(), RegistryError> {
        let affected = self
            .lock()?
            .execute(
                "UPDATE tracks SET head_sha = ?1 WHERE remote = ?2 AND branch = ?3",
                params![sha, remote.as_str(), branch],
            )
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        Self::require_row_touched(affected, remote, branch)
    }
}
