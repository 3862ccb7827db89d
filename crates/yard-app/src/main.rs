use anyhow::Result;
use integration_devbox::{DevboxCli, ProcessCommandRunner as DevboxProcessCommandRunner};
use integration_git::{GitCli, ProcessCommandRunner as GitProcessCommandRunner};
use integration_github::{GhCli, ProcessCommandRunner as GhProcessCommandRunner};
use integration_tmux::{ProcessCommandRunner as TmuxProcessCommandRunner, TmuxCli};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use yard_core::{
    CiState, CoreError, PullRequestState, ReviewState, SqliteTrackRegistry, Track, TrackKind,
    TrackStatus,
};
use yard_engine::{EngineSettings, RemoteBranchInfo, TrackEngine};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    New { branch: String, kind: TrackKind },
    Delete { branch: String, delete_remote: bool },
    Sync { branch: String },
    Jump { branch: String },
    Assistant { branch: String },
    List,
    Remote,
}

#[tokio::main]
async fn main() -> Result<()> {
    let command = parse_cli(std::env::args().skip(1).collect())?;
    let config = yard_config::load_from_env()?;
    init_file_logging(&config.database_path)?;
    config.validate()?;

    let registry = Arc::new(SqliteTrackRegistry::open(&config.database_path)?);
    let vcs = Arc::new(GitCli::new(GitProcessCommandRunner)?);
    let review = Arc::new(GhCli::new(GhProcessCommandRunner)?);
    let remote_env = Arc::new(DevboxCli::new(DevboxProcessCommandRunner)?);
    let mux = Arc::new(TmuxCli::new(TmuxProcessCommandRunner)?);

    let engine = TrackEngine::new(
        registry,
        vcs,
        review,
        remote_env,
        mux,
        EngineSettings {
            repo_path: PathBuf::from(&config.repo.path),
            remote: config.repo.remote.as_str().into(),
            worktree_base: PathBuf::from(&config.worktree_base),
            session: config.session.clone(),
            assistant_command: config.assistant_command.clone(),
        },
    );

    run_command(&engine, command).await
}

async fn run_command(engine: &TrackEngine, command: Command) -> Result<()> {
    match command {
        Command::New { branch, kind } => {
            let track = engine.create_track(&branch, kind).await?;
            println!(
                "Created {} track for `{}` at {}",
                track.kind(),
                track.branch,
                track.environment.locator()
            );
        }
        Command::Delete {
            branch,
            delete_remote,
        } => {
            engine.delete_track(&branch, delete_remote).await?;
            println!("Deleted track for `{branch}`");
        }
        Command::Sync { branch } => {
            let outcome = engine.sync_track(&branch).await?;
            if outcome.conflict {
                let location = outcome
                    .conflict_path
                    .as_deref()
                    .map(Path::display)
                    .map(|path| path.to_string())
                    .unwrap_or_default();
                println!("Rebase conflict in {location}; resolve it there, then sync again");
            } else {
                println!("Rebased and pushed `{branch}`");
                if outcome.pr_created {
                    if let Some(number) = outcome.pr_number {
                        println!("Opened pull request #{number}");
                    }
                } else if let Some(number) = outcome.pr_number {
                    println!("Pull request #{number} already open");
                }
            }
        }
        Command::Jump { branch } => engine.jump(&branch).await?,
        Command::Assistant { branch } => engine.run_assistant(&branch).await?,
        Command::List => {
            let tracks = engine.list_with_status().await?;
            if tracks.is_empty() {
                println!("No tracks. Create one with `yard new <branch>`.");
                return Ok(());
            }
            println!("{:<32} {:<11} {}", "BRANCH", "KIND", "STATUS");
            for (track, status) in &tracks {
                println!(
                    "{:<32} {:<11} {}",
                    track.branch,
                    track.kind().to_string(),
                    render_status(track, status)
                );
            }
        }
        Command::Remote => {
            let branches = engine.list_remote_branches().await?;
            if branches.is_empty() {
                println!("No remote branches with your open pull requests.");
                return Ok(());
            }
            println!("{:<32} {:<10} {:<8} {}", "BRANCH", "COMMIT", "AGE", "PR");
            for branch in &branches {
                println!("{}", render_remote_branch(branch));
            }
        }
    }

    Ok(())
}

fn parse_cli(args: Vec<String>) -> Result<Command, CoreError> {
    let mut args = args.into_iter();
    let Some(command) = args.next() else {
        print_cli_help();
        std::process::exit(0);
    };

    let parsed = match command.as_str() {
        "new" => {
            let (branch, flags) = read_branch_and_flags("new", args, &["--remote-env"])?;
            Command::New {
                branch,
                kind: if flags.contains(&"--remote-env".to_owned()) {
                    TrackKind::RemoteEnv
                } else {
                    TrackKind::Worktree
                },
            }
        }
        "delete" => {
            let (branch, flags) =
                read_branch_and_flags("delete", args, &["--delete-remote-branch"])?;
            Command::Delete {
                branch,
                delete_remote: flags.contains(&"--delete-remote-branch".to_owned()),
            }
        }
        "sync" => Command::Sync {
            branch: read_branch("sync", args)?,
        },
        "jump" => Command::Jump {
            branch: read_branch("jump", args)?,
        },
        "ai" => Command::Assistant {
            branch: read_branch("ai", args)?,
        },
        "list" => Command::List,
        "remote" => Command::Remote,
        "help" | "--help" | "-h" => {
            print_cli_help();
            std::process::exit(0);
        }
        unknown => {
            return Err(CoreError::Configuration(format!(
                "Unknown command '{unknown}'. Run `yard help` for usage."
            )));
        }
    };

    Ok(parsed)
}

fn read_branch(command: &str, mut args: impl Iterator<Item = String>) -> Result<String, CoreError> {
    let branch = args.next().ok_or_else(|| {
        CoreError::Configuration(format!("Missing branch name. Use `yard {command} <branch>`."))
    })?;
    if let Some(extra) = args.next() {
        return Err(CoreError::Configuration(format!(
            "Unexpected argument '{extra}'. Use `yard {command} <branch>`."
        )));
    }
    Ok(branch)
}

fn read_branch_and_flags(
    command: &str,
    args: impl Iterator<Item = String>,
    allowed_flags: &[&str],
) -> Result<(String, Vec<String>), CoreError> {
    let mut branch = None;
    let mut flags = Vec::new();

    for arg in args {
        if arg.starts_with("--") {
            if !allowed_flags.contains(&arg.as_str()) {
                return Err(CoreError::Configuration(format!(
                    "Unknown flag '{arg}' for `yard {command}`."
                )));
            }
            flags.push(arg);
        } else if branch.is_none() {
            branch = Some(arg);
        } else {
            return Err(CoreError::Configuration(format!(
                "Unexpected argument '{arg}'. `yard {command}` takes one branch name."
            )));
        }
    }

    let branch = branch.ok_or_else(|| {
        CoreError::Configuration(format!("Missing branch name. Use `yard {command} <branch>`."))
    })?;
    Ok((branch, flags))
}

fn print_cli_help() {
    println!("Usage: yard <command> [args]");
    println!();
    println!("  new <branch> [--remote-env]            Create a track (worktree by default)");
    println!("  delete <branch> [--delete-remote-branch]  Delete a track");
    println!("  sync <branch>                          Rebase onto the default branch and push");
    println!("  jump <branch>                          Switch to the track's tmux window");
    println!("  ai <branch>                            Run the coding assistant in the track");
    println!("  list                                   List tracks with live status");
    println!("  remote                                 List remote branches with your open PRs");
    println!("  help                                   Show this help message");
}

fn init_file_logging(database_path: &str) -> Result<(), CoreError> {
    let log_path = log_file_path(database_path);
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|error| {
                CoreError::Configuration(format!(
                    "failed to create log directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|error| {
            CoreError::Configuration(format!(
                "failed to open log file '{}': {error}",
                log_path.display()
            ))
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();

    Ok(())
}

fn log_file_path(database_path: &str) -> PathBuf {
    let database = Path::new(database_path);
    database
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("yard.log")
}

fn render_status(track: &Track, status: &TrackStatus) -> String {
    let mut parts = Vec::new();

    if let Some(vcs) = &status.vcs {
        parts.push(if vcs.clean { "clean".to_owned() } else { "dirty".to_owned() });
        if vcs.ahead > 0 {
            parts.push(format!("ahead {}", vcs.ahead));
        }
        if vcs.behind > 0 {
            parts.push(format!("behind {}", vcs.behind));
        }
    }

    if status.sha_drift {
        parts.push("drift".to_owned());
    }

    if let Some(pr) = &status.review {
        parts.push(format!(
            "PR #{} {} ci:{} review:{}",
            pr.number,
            render_pr_state(pr.state),
            render_ci_state(pr.ci),
            render_review_state(pr.review)
        ));
    }

    if status.stale {
        parts.push("stale".to_owned());
    }

    if parts.is_empty() {
        parts.push(format!("{} (no local status)", track.environment.locator()));
    }

    parts.join("  ")
}

fn render_remote_branch(branch: &RemoteBranchInfo) -> String {
    let commit = branch.last_commit.get(..7).unwrap_or(&branch.last_commit);
    let age = branch
        .age
        .map(render_age)
        .unwrap_or_else(|| "-".to_owned());
    let pr = branch
        .pr_number
        .map(|number| format!("#{number}"))
        .unwrap_or_else(|| "-".to_owned());
    format!("{:<32} {:<10} {:<8} {}", branch.name, commit, age, pr)
}

fn render_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs >= 86_400 {
        format!("{}d", secs / 86_400)
    } else if secs >= 3_600 {
        format!("{}h", secs / 3_600)
    } else {
        format!("{}m", secs / 60)
    }
}

fn render_pr_state(state: PullRequestState) -> &'static str {
    match state {
        PullRequestState::Open => "open",
        PullRequestState::Closed => "closed",
        PullRequestState::Merged => "merged",
    }
}

fn render_ci_state(state: CiState) -> &'static str {
    match state {
        CiState::Passing => "passing",
        CiState::Pending => "pending",
        CiState::Failing => "failing",
        CiState::Unknown => "unknown",
    }
}

fn render_review_state(state: ReviewState) -> &'static str {
    match state {
        ReviewState::Approved => "approved",
        ReviewState::ChangesRequested => "changes-requested",
        ReviewState::Pending => "pending",
        ReviewState::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use yard_core::{PullRequest, TrackEnvironment, VcsStatus};

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn worktree_track() -> Track {
        Track {
            remote: "acme/widgets".into(),
            branch: "feature/x".to_owned(),
            head_sha: "a1b2c3d4".to_owned(),
            environment: TrackEnvironment::Worktree {
                path: PathBuf::from("/home/dev/worktrees/feature-x-a1b2c3d"),
            },
            created_at: OffsetDateTime::now_utc(),
            last_accessed_at: None,
        }
    }

    #[test]
    fn new_defaults_to_worktree_kind() {
        let command = parse_cli(args(&["new", "feature/x"])).expect("parse");
        assert_eq!(
            command,
            Command::New {
                branch: "feature/x".to_owned(),
                kind: TrackKind::Worktree,
            }
        );
    }

    #[test]
    fn new_accepts_the_remote_env_flag_in_any_position() {
        let command = parse_cli(args(&["new", "--remote-env", "feature/x"])).expect("parse");
        assert_eq!(
            command,
            Command::New {
                branch: "feature/x".to_owned(),
                kind: TrackKind::RemoteEnv,
            }
        );
    }

    #[test]
    fn delete_parses_the_remote_branch_flag() {
        let command =
            parse_cli(args(&["delete", "feature/x", "--delete-remote-branch"])).expect("parse");
        assert_eq!(
            command,
            Command::Delete {
                branch: "feature/x".to_owned(),
                delete_remote: true,
            }
        );
    }

    #[test]
    fn unknown_commands_and_flags_are_rejected() {
        assert!(parse_cli(args(&["frobnicate"])).is_err());
        assert!(parse_cli(args(&["new", "feature/x", "--bogus"])).is_err());
        assert!(parse_cli(args(&["sync"])).is_err());
        assert!(parse_cli(args(&["sync", "a", "b"])).is_err());
    }

    #[test]
    fn status_rendering_orders_signals() {
        let status = TrackStatus {
            vcs: Some(VcsStatus {
                clean: false,
                ahead: 2,
                behind: 1,
            }),
            sha_drift: true,
            review: Some(PullRequest {
                number: 42,
                branch: "feature/x".to_owned(),
                state: PullRequestState::Open,
                ci: CiState::Pending,
                review: ReviewState::Unknown,
            }),
            stale: true,
        };

        let rendered = render_status(&worktree_track(), &status);
        assert_eq!(
            rendered,
            "dirty  ahead 2  behind 1  drift  PR #42 open ci:pending review:unknown  stale"
        );
    }

    #[test]
    fn status_rendering_falls_back_to_the_locator() {
        let rendered = render_status(&worktree_track(), &TrackStatus::default());
        assert!(rendered.contains("feature-x-a1b2c3d"));
    }

    #[test]
    fn ages_render_in_coarse_units() {
        assert_eq!(render_age(Duration::from_secs(90)), "1m");
        assert_eq!(render_age(Duration::from_secs(2 * 3_600)), "2h");
        assert_eq!(render_age(Duration::from_secs(3 * 86_400)), "3d");
    }

    #[test]
    fn remote_branch_rows_shorten_commits() {
        let row = render_remote_branch(&RemoteBranchInfo {
            name: "feature/x".to_owned(),
            last_commit: "a1b2c3d4e5f6".to_owned(),
            age: Some(Duration::from_secs(86_400)),
            pr_number: Some(7),
        });
        assert!(row.contains("a1b2c3d "));
        assert!(row.contains("1d"));
        assert!(row.trim_end().ends_with("#7"));
    }
}
