use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use yard_core::{CoreError, RebaseOutcome, VersionControl};

const ENV_GIT_BIN: &str = "YARD_GIT_BIN";

pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<std::process::Output> {
        Command::new(program).args(args).output()
    }
}

/// [`VersionControl`] implemented over the git CLI. Every operation runs
/// `git -C <workdir> …` with an explicit argument vector; nothing passes
/// through a shell.
pub struct GitCli<R: CommandRunner> {
    runner: R,
    binary: PathBuf,
}

impl<R: CommandRunner> GitCli<R> {
    pub fn new(runner: R) -> Result<Self, CoreError> {
        let binary = std::env::var_os(ENV_GIT_BIN)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("git"));
        if binary.as_os_str().is_empty() {
            return Err(CoreError::Configuration(format!(
                "{ENV_GIT_BIN} is set but empty. Provide a valid git binary path or unset it."
            )));
        }

        Ok(Self::with_binary(runner, binary))
    }

    pub fn with_binary(runner: R, binary: PathBuf) -> Self {
        Self { runner, binary }
    }

    fn base_args(workdir: &Path) -> Vec<OsString> {
        vec![OsString::from("-C"), workdir.as_os_str().to_owned()]
    }

    fn fetch_args(workdir: &Path) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([OsString::from("fetch"), OsString::from("origin")]);
        args
    }

    fn symbolic_ref_args(workdir: &Path) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([
            OsString::from("symbolic-ref"),
            OsString::from("refs/remotes/origin/HEAD"),
        ]);
        args
    }

    fn verify_ref_args(workdir: &Path, reference: &str) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([
            OsString::from("rev-parse"),
            OsString::from("--verify"),
            OsString::from("--quiet"),
            OsString::from(reference),
        ]);
        args
    }

    fn create_branch_args(workdir: &Path, branch: &str, base: &str) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([
            OsString::from("branch"),
            OsString::from(branch),
            OsString::from(base),
        ]);
        args
    }

    fn add_worktree_args(workdir: &Path, path: &Path, branch: &str) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([
            OsString::from("worktree"),
            OsString::from("add"),
            path.as_os_str().to_owned(),
            OsString::from(branch),
        ]);
        args
    }

    fn remove_worktree_args(workdir: &Path, path: &Path) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([
            OsString::from("worktree"),
            OsString::from("remove"),
            path.as_os_str().to_owned(),
        ]);
        args
    }

    fn prune_worktrees_args(workdir: &Path) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([OsString::from("worktree"), OsString::from("prune")]);
        args
    }

    fn rebase_args(workdir: &Path, onto: &str) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([OsString::from("rebase"), OsString::from(onto)]);
        args
    }

    fn push_args(workdir: &Path, branch: &str) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([
            OsString::from("push"),
            OsString::from("origin"),
            OsString::from(branch),
        ]);
        args
    }

    fn force_push_args(workdir: &Path, branch: &str) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([
            OsString::from("push"),
            OsString::from("--force-with-lease"),
            OsString::from("origin"),
            OsString::from(branch),
        ]);
        args
    }

    fn delete_remote_branch_args(workdir: &Path, branch: &str) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([
            OsString::from("push"),
            OsString::from("origin"),
            OsString::from("--delete"),
            OsString::from(branch),
        ]);
        args
    }

    fn ahead_behind_args(workdir: &Path, branch: &str, base: &str) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([
            OsString::from("rev-list"),
            OsString::from("--left-right"),
            OsString::from("--count"),
            OsString::from(format!("{branch}...{base}")),
        ]);
        args
    }

    fn head_sha_args(workdir: &Path) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([OsString::from("rev-parse"), OsString::from("HEAD")]);
        args
    }

    fn status_porcelain_args(workdir: &Path) -> Vec<OsString> {
        let mut args = Self::base_args(workdir);
        args.extend([OsString::from("status"), OsString::from("--porcelain")]);
        args
    }

    fn run_git_raw(&self, args: &[OsString]) -> Result<std::process::Output, CoreError> {
        let program = self
            .binary
            .to_str()
            .ok_or_else(|| CoreError::Configuration("Invalid git binary path".to_owned()))?;
        self.runner
            .run(program, args)
            .map_err(|error| match error.kind() {
                io::ErrorKind::NotFound => CoreError::DependencyUnavailable(format!(
                    "Git CLI `{}` was not found. Install Git or set {ENV_GIT_BIN} to a valid binary path.",
                    self.binary.display()
                )),
                _ => CoreError::DependencyUnavailable(format!(
                    "Failed to execute Git CLI `{}`: {error}",
                    self.binary.display()
                )),
            })
    }

    fn run_git(&self, args: &[OsString]) -> Result<std::process::Output, CoreError> {
        let output = self.run_git_raw(args)?;
        if output.status.success() {
            return Ok(output);
        }

        Err(self.command_failed(args, &output))
    }

    fn command_failed(&self, args: &[OsString], output: &std::process::Output) -> CoreError {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        let detail = if !stderr.is_empty() {
            stderr
        } else if !stdout.is_empty() {
            stdout
        } else {
            format!("exit status {}", output.status)
        };
        let rendered_args = args
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(" ");

        CoreError::DependencyUnavailable(format!(
            "Git command failed (`{} {rendered_args}`): {detail}",
            self.binary.display()
        ))
    }

    fn stdout_line(output: &std::process::Output) -> String {
        String::from_utf8_lossy(&output.stdout).trim().to_owned()
    }

    /// A rebase stopped on conflicts leaves `REBASE_HEAD` resolvable; a
    /// rebase that failed outright does not. Probing the ref is the
    /// structured replacement for sniffing "CONFLICT" in stderr.
    fn rebase_in_progress(&self, workdir: &Path) -> Result<bool, CoreError> {
        let output = self.run_git_raw(&Self::verify_ref_args(workdir, "REBASE_HEAD"))?;
        Ok(output.status.success())
    }

    fn parse_ahead_behind(stdout: &[u8]) -> Result<(u32, u32), CoreError> {
        let output = String::from_utf8_lossy(stdout);
        let mut parts = output.split_whitespace();

        let ahead = parts
            .next()
            .ok_or_else(|| {
                CoreError::DependencyUnavailable(
                    "Git ahead/behind output is missing the `ahead` count.".to_owned(),
                )
            })?
            .parse::<u32>()
            .map_err(|error| {
                CoreError::DependencyUnavailable(format!(
                    "Git ahead/behind output has invalid `ahead` count: {error}"
                ))
            })?;

        let behind = parts
            .next()
            .ok_or_else(|| {
                CoreError::DependencyUnavailable(
                    "Git ahead/behind output is missing the `behind` count.".to_owned(),
                )
            })?
            .parse::<u32>()
            .map_err(|error| {
                CoreError::DependencyUnavailable(format!(
                    "Git ahead/behind output has invalid `behind` count: {error}"
                ))
            })?;

        Ok((ahead, behind))
    }

    fn parse_default_branch(symbolic_ref: &str) -> Option<String> {
        symbolic_ref
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
    }
}

#[async_trait::async_trait]
impl<R: CommandRunner> VersionControl for GitCli<R> {
    async fn fetch(&self, workdir: &Path) -> Result<(), CoreError> {
        self.run_git(&Self::fetch_args(workdir)).map(|_| ())
    }

    async fn default_branch(&self, workdir: &Path) -> Result<String, CoreError> {
        let output = self.run_git_raw(&Self::symbolic_ref_args(workdir))?;
        if output.status.success() {
            if let Some(name) = Self::parse_default_branch(&Self::stdout_line(&output)) {
                return Ok(name);
            }
        }

        // origin/HEAD is unset in clones added with `git remote add`; try
        // the conventional names before giving up.
        for candidate in ["main", "master"] {
            let probe =
                self.run_git_raw(&Self::verify_ref_args(workdir, &format!("origin/{candidate}")))?;
            if probe.status.success() {
                return Ok(candidate.to_owned());
            }
        }

        Err(CoreError::DependencyUnavailable(
            "Could not determine the default branch: origin/HEAD is unset and neither origin/main nor origin/master exists.".to_owned(),
        ))
    }

    async fn create_branch(
        &self,
        workdir: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), CoreError> {
        self.run_git(&Self::create_branch_args(workdir, branch, base))
            .map(|_| ())
    }

    async fn branch_sha(
        &self,
        workdir: &Path,
        reference: &str,
    ) -> Result<Option<String>, CoreError> {
        let output = self.run_git_raw(&Self::verify_ref_args(workdir, reference))?;
        if !output.status.success() {
            return Ok(None);
        }

        let sha = Self::stdout_line(&output);
        Ok((!sha.is_empty()).then_some(sha))
    }

    async fn add_worktree(
        &self,
        workdir: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), CoreError> {
        self.run_git(&Self::add_worktree_args(workdir, path, branch))
            .map(|_| ())
    }

    async fn remove_worktree(&self, workdir: &Path, path: &Path) -> Result<(), CoreError> {
        self.run_git(&Self::remove_worktree_args(workdir, path))
            .map(|_| ())
    }

    async fn prune_worktrees(&self, workdir: &Path) -> Result<(), CoreError> {
        self.run_git(&Self::prune_worktrees_args(workdir))
            .map(|_| ())
    }

    async fn rebase_onto(&self, workdir: &Path, onto: &str) -> Result<RebaseOutcome, CoreError> {
        let args = Self::rebase_args(workdir, onto);
        let output = self.run_git_raw(&args)?;
        if output.status.success() {
            return Ok(RebaseOutcome::Clean);
        }

        if self.rebase_in_progress(workdir)? {
            return Ok(RebaseOutcome::Conflict);
        }

        Err(self.command_failed(&args, &output))
    }

    async fn push(&self, workdir: &Path, branch: &str) -> Result<(), CoreError> {
        self.run_git(&Self::push_args(workdir, branch)).map(|_| ())
    }

    async fn force_push(&self, workdir: &Path, branch: &str) -> Result<(), CoreError> {
        self.run_git(&Self::force_push_args(workdir, branch))
            .map(|_| ())
    }

    async fn delete_remote_branch(&self, workdir: &Path, branch: &str) -> Result<(), CoreError> {
        self.run_git(&Self::delete_remote_branch_args(workdir, branch))
            .map(|_| ())
    }

    async fn ahead_behind(
        &self,
        workdir: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(u32, u32), CoreError> {
        let output = self.run_git(&Self::ahead_behind_args(workdir, branch, base))?;
        Self::parse_ahead_behind(&output.stdout)
    }

    async fn head_sha(&self, workdir: &Path) -> Result<String, CoreError> {
        let output = self.run_git(&Self::head_sha_args(workdir))?;
        let sha = Self::stdout_line(&output);
        if sha.is_empty() {
            return Err(CoreError::DependencyUnavailable(
                "Git rev-parse HEAD produced no output.".to_owned(),
            ));
        }
        Ok(sha)
    }

    async fn is_dirty(&self, workdir: &Path) -> Result<bool, CoreError> {
        let output = self.run_git(&Self::status_porcelain_args(workdir))?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StubRunner {
        calls: Mutex<Vec<(String, Vec<OsString>)>>,
        results: Mutex<VecDeque<io::Result<std::process::Output>>>,
    }

    impl StubRunner {
        fn with_results(results: Vec<io::Result<std::process::Output>>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                results: Mutex::new(VecDeque::from(results)),
            }
        }
    }

    impl CommandRunner for StubRunner {
        fn run(&self, program: &str, args: &[OsString]) -> io::Result<std::process::Output> {
            self.calls
                .lock()
                .expect("lock")
                .push((program.to_owned(), args.to_vec()));

            self.results
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "missing stubbed command output",
                    ))
                })
        }
    }

    fn output_with_status(code: i32, stdout: &[u8], stderr: &[u8]) -> std::process::Output {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            std::process::Output {
                status: std::process::ExitStatus::from_raw(code),
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
            }
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::ExitStatusExt;
            std::process::Output {
                status: std::process::ExitStatus::from_raw(code as u32),
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
            }
        }
    }

    fn success_output() -> std::process::Output {
        output_with_status(0, &[], &[])
    }

    fn failure_output() -> std::process::Output {
        output_with_status(1 << 8, &[], b"fatal: boom\n")
    }

    fn provider(results: Vec<io::Result<std::process::Output>>) -> GitCli<StubRunner> {
        GitCli::with_binary(StubRunner::with_results(results), PathBuf::from("git"))
    }

    fn workdir() -> PathBuf {
        PathBuf::from("/home/dev/repo")
    }

    #[tokio::test]
    async fn fetch_runs_git_with_argument_vector() {
        let git = provider(vec![Ok(success_output())]);
        git.fetch(&workdir()).await.expect("fetch");

        let calls = git.runner.calls.lock().expect("lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "git");
        assert_eq!(calls[0].1, GitCli::<StubRunner>::fetch_args(&workdir()));
    }

    #[tokio::test]
    async fn default_branch_parses_origin_head_symbolic_ref() {
        let git = provider(vec![Ok(output_with_status(
            0,
            b"refs/remotes/origin/trunk\n",
            b"",
        ))]);

        let name = git.default_branch(&workdir()).await.expect("default");
        assert_eq!(name, "trunk");
    }

    #[tokio::test]
    async fn default_branch_falls_back_to_main_when_origin_head_is_unset() {
        let git = provider(vec![Ok(failure_output()), Ok(success_output())]);

        let name = git.default_branch(&workdir()).await.expect("default");
        assert_eq!(name, "main");
    }

    #[tokio::test]
    async fn default_branch_falls_back_to_master_after_main() {
        let git = provider(vec![
            Ok(failure_output()),
            Ok(failure_output()),
            Ok(success_output()),
        ]);

        let name = git.default_branch(&workdir()).await.expect("default");
        assert_eq!(name, "master");
    }

    #[tokio::test]
    async fn default_branch_errors_when_nothing_resolves() {
        let git = provider(vec![
            Ok(failure_output()),
            Ok(failure_output()),
            Ok(failure_output()),
        ]);

        let err = git
            .default_branch(&workdir())
            .await
            .expect_err("expected failure");
        assert!(err.to_string().contains("default branch"));
    }

    #[tokio::test]
    async fn branch_sha_returns_none_for_unresolvable_refs() {
        let git = provider(vec![Ok(failure_output())]);

        let sha = git
            .branch_sha(&workdir(), "origin/ghost")
            .await
            .expect("probe");
        assert!(sha.is_none());
    }

    #[tokio::test]
    async fn branch_sha_trims_rev_parse_output() {
        let git = provider(vec![Ok(output_with_status(0, b"a1b2c3d4\n", b""))]);

        let sha = git
            .branch_sha(&workdir(), "feature/alpha")
            .await
            .expect("probe");
        assert_eq!(sha.as_deref(), Some("a1b2c3d4"));
    }

    #[tokio::test]
    async fn add_worktree_uses_expected_arguments() {
        let git = provider(vec![Ok(success_output())]);
        let path = PathBuf::from("/home/dev/worktrees/feature-alpha-a1b2c3d");

        git.add_worktree(&workdir(), &path, "feature/alpha")
            .await
            .expect("add worktree");

        let calls = git.runner.calls.lock().expect("lock");
        assert_eq!(
            calls[0].1,
            GitCli::<StubRunner>::add_worktree_args(&workdir(), &path, "feature/alpha")
        );
    }

    #[tokio::test]
    async fn rebase_conflict_is_reported_as_a_structured_outcome() {
        // rebase exits non-zero, then REBASE_HEAD resolves
        let git = provider(vec![Ok(failure_output()), Ok(success_output())]);

        let outcome = git
            .rebase_onto(&workdir(), "origin/main")
            .await
            .expect("rebase");
        assert_eq!(outcome, RebaseOutcome::Conflict);

        let calls = git.runner.calls.lock().expect("lock");
        assert_eq!(
            calls[1].1,
            GitCli::<StubRunner>::verify_ref_args(&workdir(), "REBASE_HEAD")
        );
    }

    #[tokio::test]
    async fn rebase_hard_failure_is_an_error_not_a_conflict() {
        // rebase exits non-zero and REBASE_HEAD does not resolve
        let git = provider(vec![Ok(failure_output()), Ok(failure_output())]);

        let err = git
            .rebase_onto(&workdir(), "origin/main")
            .await
            .expect_err("expected hard failure");
        assert!(err.to_string().contains("rebase"));
    }

    #[tokio::test]
    async fn clean_rebase_does_not_probe_rebase_head() {
        let git = provider(vec![Ok(success_output())]);

        let outcome = git
            .rebase_onto(&workdir(), "origin/main")
            .await
            .expect("rebase");
        assert_eq!(outcome, RebaseOutcome::Clean);
        assert_eq!(git.runner.calls.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn force_push_uses_lease() {
        let git = provider(vec![Ok(success_output())]);
        git.force_push(&workdir(), "feature/alpha")
            .await
            .expect("force push");

        let calls = git.runner.calls.lock().expect("lock");
        let rendered: Vec<String> = calls[0]
            .1
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        assert!(rendered.contains(&"--force-with-lease".to_owned()));
    }

    #[tokio::test]
    async fn ahead_behind_parses_left_right_counts() {
        let git = provider(vec![Ok(output_with_status(0, b"2\t5\n", b""))]);

        let (ahead, behind) = git
            .ahead_behind(&workdir(), "feature/alpha", "origin/main")
            .await
            .expect("counts");
        assert_eq!(ahead, 2);
        assert_eq!(behind, 5);
    }

    #[tokio::test]
    async fn ahead_behind_rejects_non_numeric_output() {
        let git = provider(vec![Ok(output_with_status(0, b"ahead\t5\n", b""))]);

        let err = git
            .ahead_behind(&workdir(), "feature/alpha", "origin/main")
            .await
            .expect_err("expected parse error");
        assert!(err.to_string().contains("invalid `ahead`"));
    }

    #[tokio::test]
    async fn is_dirty_reflects_porcelain_output() {
        let git = provider(vec![
            Ok(output_with_status(0, b" M src/lib.rs\n", b"")),
            Ok(output_with_status(0, b"", b"")),
        ]);

        assert!(git.is_dirty(&workdir()).await.expect("dirty"));
        assert!(!git.is_dirty(&workdir()).await.expect("clean"));
    }

    #[tokio::test]
    async fn missing_git_binary_is_actionable() {
        let git = provider(vec![Err(io::Error::new(io::ErrorKind::NotFound, "missing"))]);

        let err = git.fetch(&workdir()).await.expect_err("expected error");
        assert!(err.to_string().contains("Install Git"));
    }

    #[tokio::test]
    async fn command_failure_includes_stderr_detail() {
        let git = provider(vec![Ok(output_with_status(
            1 << 8,
            b"",
            b"fatal: repository not found\n",
        ))]);

        let err = git
            .push(&workdir(), "feature/alpha")
            .await
            .expect_err("expected error");
        assert!(err.to_string().contains("repository not found"));
    }
}
