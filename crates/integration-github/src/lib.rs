use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use yard_core::{
    CiState, CodeReviewHost, CoreError, PullRequest, PullRequestState, RemoteBranchSummary,
    RemoteId, ReviewState,
};

const ENV_GH_BIN: &str = "YARD_GH_BIN";
const PR_FIELDS: &str = "number,headRefName,state,statusCheckRollup,reviewDecision";

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

/// [`CodeReviewHost`] backed by the GitHub CLI. Authentication and API
/// access are delegated to `gh`, so the host never handles tokens itself.
pub struct GhCli<R: CommandRunner> {
    runner: R,
    binary: PathBuf,
}

/// Shape of `gh pr view/list --json` output for the fields in [`PR_FIELDS`].
/// `statusCheckRollup` is a bare string in some gh versions and an array of
/// check objects in others, so it is held loosely and normalized later.
#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: u64,
    #[serde(rename = "headRefName")]
    head_ref_name: String,
    state: String,
    #[serde(rename = "statusCheckRollup", default)]
    status_check_rollup: serde_json::Value,
    #[serde(rename = "reviewDecision", default)]
    review_decision: String,
}

#[derive(Debug, Deserialize)]
struct GhBranch {
    name: String,
    commit: GhBranchCommit,
}

#[derive(Debug, Deserialize)]
struct GhBranchCommit {
    sha: String,
    commit: GhCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GhCommitDetail {
    committer: GhCommitter,
}

#[derive(Debug, Deserialize)]
struct GhCommitter {
    #[serde(default)]
    date: String,
}

impl<R: CommandRunner> GhCli<R> {
    pub fn new(runner: R) -> Result<Self, CoreError> {
        let binary = std::env::var_os(ENV_GH_BIN)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("gh"));
        if binary.as_os_str().is_empty() {
            return Err(CoreError::Configuration(format!(
                "{ENV_GH_BIN} is set but empty. Provide a valid gh binary path or unset it."
            )));
        }

        Ok(Self::with_binary(runner, binary))
    }

    pub fn with_binary(runner: R, binary: PathBuf) -> Self {
        Self { runner, binary }
    }

    fn default_branch_args(remote: &RemoteId) -> Vec<OsString> {
        vec![
            OsString::from("repo"),
            OsString::from("view"),
            OsString::from(remote.as_str()),
            OsString::from("--json"),
            OsString::from("defaultBranchRef"),
            OsString::from("--jq"),
            OsString::from(".defaultBranchRef.name"),
        ]
    }

    fn current_user_args() -> Vec<OsString> {
        vec![
            OsString::from("api"),
            OsString::from("user"),
            OsString::from("--jq"),
            OsString::from(".login"),
        ]
    }

    fn view_pr_args(remote: &RemoteId, branch: &str) -> Vec<OsString> {
        vec![
            OsString::from("pr"),
            OsString::from("view"),
            OsString::from(branch),
            OsString::from("--repo"),
            OsString::from(remote.as_str()),
            OsString::from("--json"),
            OsString::from(PR_FIELDS),
        ]
    }

    fn create_pr_args(remote: &RemoteId, branch: &str, base: &str, title: &str) -> Vec<OsString> {
        vec![
            OsString::from("pr"),
            OsString::from("create"),
            OsString::from("--repo"),
            OsString::from(remote.as_str()),
            OsString::from("--head"),
            OsString::from(branch),
            OsString::from("--base"),
            OsString::from(base),
            OsString::from("--title"),
            OsString::from(title),
            OsString::from("--body"),
            OsString::from(""),
        ]
    }

    fn list_prs_args(remote: &RemoteId, author: &str) -> Vec<OsString> {
        vec![
            OsString::from("pr"),
            OsString::from("list"),
            OsString::from("--repo"),
            OsString::from(remote.as_str()),
            OsString::from("--author"),
            OsString::from(author),
            OsString::from("--state"),
            OsString::from("open"),
            OsString::from("--json"),
            OsString::from(PR_FIELDS),
        ]
    }

    fn branch_detail_args(remote: &RemoteId, branch: &str) -> Vec<OsString> {
        vec![
            OsString::from("api"),
            OsString::from(format!("repos/{}/branches/{branch}", remote.as_str())),
        ]
    }

    fn run_gh_raw(&self, args: &[OsString]) -> Result<std::process::Output, CoreError> {
        let program = self
            .binary
            .to_str()
            .ok_or_else(|| CoreError::Configuration("Invalid gh binary path".to_owned()))?;
        self.runner
            .run(program, args)
            .map_err(|error| match error.kind() {
                io::ErrorKind::NotFound => CoreError::DependencyUnavailable(format!(
                    "GitHub CLI `{}` was not found. Install gh and authenticate with `gh auth login`.",
                    self.binary.display()
                )),
                _ => CoreError::DependencyUnavailable(format!(
                    "Failed to execute GitHub CLI `{}`: {error}",
                    self.binary.display()
                )),
            })
    }

    fn run_gh(&self, args: &[OsString]) -> Result<std::process::Output, CoreError> {
        let output = self.run_gh_raw(args)?;
        if output.status.success() {
            return Ok(output);
        }

        Err(self.command_failed(args, &output))
    }

    fn command_failed(&self, args: &[OsString], output: &std::process::Output) -> CoreError {
        CoreError::DependencyUnavailable(format!(
            "GitHub CLI command failed (`{} {}`): {}",
            self.binary.display(),
            Self::render_args(args),
            Self::command_output_detail(output)
        ))
    }

    fn render_args(args: &[OsString]) -> String {
        args.iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command_output_detail(output: &std::process::Output) -> String {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if !stderr.is_empty() {
            return stderr;
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if !stdout.is_empty() {
            return stdout;
        }

        format!("exit status {}", output.status)
    }

    fn stdout_line(output: &std::process::Output) -> String {
        String::from_utf8_lossy(&output.stdout).trim().to_owned()
    }

    fn parse_json<T: serde::de::DeserializeOwned>(
        output: &std::process::Output,
        what: &str,
    ) -> Result<T, CoreError> {
        serde_json::from_slice(&output.stdout).map_err(|error| {
            CoreError::DependencyUnavailable(format!(
                "Failed to parse {what} from GitHub CLI output: {error}"
            ))
        })
    }

    fn extract_pull_request_url(output: &std::process::Output) -> Option<String> {
        for stream in [&output.stdout, &output.stderr] {
            let text = String::from_utf8_lossy(stream);
            for token in text.split_whitespace() {
                let cleaned = token
                    .trim_matches(|ch: char| ch == '"' || ch == '\'' || ch == '(' || ch == ')')
                    .trim_end_matches(|ch: char| ch == ',' || ch == ';' || ch == '.');
                if (cleaned.starts_with("https://") || cleaned.starts_with("http://"))
                    && cleaned.contains("/pull/")
                {
                    return Some(cleaned.to_owned());
                }
            }
        }

        None
    }

    fn parse_pull_request_number(url: &str) -> Result<u64, CoreError> {
        let pull_segment = url.split("/pull/").nth(1).ok_or_else(|| {
            CoreError::DependencyUnavailable(format!(
                "GitHub pull request URL did not include `/pull/`: {url}"
            ))
        })?;
        let number = pull_segment
            .chars()
            .take_while(|ch| ch.is_ascii_digit())
            .collect::<String>();
        if number.is_empty() {
            return Err(CoreError::DependencyUnavailable(format!(
                "GitHub pull request URL did not include a numeric pull request number: {url}"
            )));
        }

        number.parse::<u64>().map_err(|error| {
            CoreError::DependencyUnavailable(format!(
                "Failed to parse pull request number from URL `{url}`: {error}"
            ))
        })
    }

    fn is_missing_pull_request(detail: &str) -> bool {
        detail.contains("no pull requests found") || detail.contains("Could not resolve")
    }
}

fn parse_pr_state(state: &str) -> Result<PullRequestState, CoreError> {
    match state.to_ascii_uppercase().as_str() {
        "OPEN" => Ok(PullRequestState::Open),
        "CLOSED" => Ok(PullRequestState::Closed),
        "MERGED" => Ok(PullRequestState::Merged),
        other => Err(CoreError::DependencyUnavailable(format!(
            "GitHub reported an unrecognized pull request state `{other}`."
        ))),
    }
}

fn normalize_ci_rollup(rollup: &serde_json::Value) -> CiState {
    match rollup {
        serde_json::Value::String(status) => normalize_ci_status(status),
        serde_json::Value::Array(checks) => {
            if checks.is_empty() {
                return CiState::Unknown;
            }

            let mut pending = false;
            let mut seen_known = false;
            for check in checks {
                let status = check
                    .get("conclusion")
                    .and_then(serde_json::Value::as_str)
                    .filter(|value| !value.is_empty())
                    .or_else(|| check.get("state").and_then(serde_json::Value::as_str))
                    .unwrap_or("");
                match normalize_ci_status(status) {
                    CiState::Failing => return CiState::Failing,
                    CiState::Pending => pending = true,
                    CiState::Passing => seen_known = true,
                    CiState::Unknown => {}
                }
            }

            if pending {
                CiState::Pending
            } else if seen_known {
                CiState::Passing
            } else {
                CiState::Unknown
            }
        }
        _ => CiState::Unknown,
    }
}

fn normalize_ci_status(status: &str) -> CiState {
    match status.to_ascii_uppercase().as_str() {
        "SUCCESS" => CiState::Passing,
        "FAILURE" | "ERROR" => CiState::Failing,
        "PENDING" | "EXPECTED" | "QUEUED" | "IN_PROGRESS" => CiState::Pending,
        _ => CiState::Unknown,
    }
}

fn normalize_review_decision(decision: &str) -> ReviewState {
    match decision.to_ascii_uppercase().as_str() {
        "APPROVED" => ReviewState::Approved,
        "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
        "REVIEW_REQUIRED" => ReviewState::Pending,
        _ => ReviewState::Unknown,
    }
}

impl GhPullRequest {
    fn into_pull_request(self) -> Result<PullRequest, CoreError> {
        Ok(PullRequest {
            number: self.number,
            branch: self.head_ref_name,
            state: parse_pr_state(&self.state)?,
            ci: normalize_ci_rollup(&self.status_check_rollup),
            review: normalize_review_decision(&self.review_decision),
        })
    }
}

#[async_trait::async_trait]
impl<R: CommandRunner> CodeReviewHost for GhCli<R> {
    async fn default_branch(&self, remote: &RemoteId) -> Result<String, CoreError> {
        let output = self.run_gh(&Self::default_branch_args(remote))?;
        let name = Self::stdout_line(&output);
        if name.is_empty() {
            return Err(CoreError::DependencyUnavailable(format!(
                "GitHub reported no default branch for `{remote}`."
            )));
        }
        Ok(name)
    }

    async fn current_user(&self) -> Result<String, CoreError> {
        let output = self.run_gh(&Self::current_user_args())?;
        let login = Self::stdout_line(&output);
        if login.is_empty() {
            return Err(CoreError::DependencyUnavailable(
                "GitHub CLI is not authenticated. Run `gh auth login`.".to_owned(),
            ));
        }
        Ok(login)
    }

    async fn find_pull_request(
        &self,
        remote: &RemoteId,
        branch: &str,
    ) -> Result<Option<PullRequest>, CoreError> {
        let args = Self::view_pr_args(remote, branch);
        let output = self.run_gh_raw(&args)?;
        if !output.status.success() {
            let detail = Self::command_output_detail(&output);
            if Self::is_missing_pull_request(&detail) {
                return Ok(None);
            }
            return Err(self.command_failed(&args, &output));
        }

        if Self::stdout_line(&output).is_empty() {
            return Ok(None);
        }

        let raw: GhPullRequest = Self::parse_json(&output, "pull request")?;
        raw.into_pull_request().map(Some)
    }

    async fn create_pull_request(
        &self,
        remote: &RemoteId,
        branch: &str,
        base: &str,
        title: &str,
    ) -> Result<u64, CoreError> {
        let output = self.run_gh(&Self::create_pr_args(remote, branch, base, title))?;
        let url = Self::extract_pull_request_url(&output).ok_or_else(|| {
            CoreError::DependencyUnavailable(format!(
                "GitHub CLI did not report a pull request URL: {}",
                Self::command_output_detail(&output)
            ))
        })?;

        Self::parse_pull_request_number(&url)
    }

    async fn list_my_open_pull_requests(
        &self,
        remote: &RemoteId,
    ) -> Result<Vec<PullRequest>, CoreError> {
        let user = self.current_user().await?;
        let output = self.run_gh(&Self::list_prs_args(remote, &user))?;
        if Self::stdout_line(&output).is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<GhPullRequest> = Self::parse_json(&output, "pull request list")?;
        raw.into_iter()
            .map(GhPullRequest::into_pull_request)
            .collect()
    }

    async fn branches_with_my_open_pull_requests(
        &self,
        remote: &RemoteId,
    ) -> Result<Vec<RemoteBranchSummary>, CoreError> {
        let prs = self.list_my_open_pull_requests(remote).await?;

        let mut names: Vec<String> = prs.into_iter().map(|pr| pr.branch).collect();
        names.sort();
        names.dedup();

        let mut branches = Vec::with_capacity(names.len());
        for name in names {
            // The branch may have been deleted since the PR list was taken.
            let output = self.run_gh_raw(&Self::branch_detail_args(remote, &name))?;
            if !output.status.success() {
                continue;
            }

            let detail: GhBranch = match Self::parse_json(&output, "branch detail") {
                Ok(detail) => detail,
                Err(_) => continue,
            };

            let age = OffsetDateTime::parse(&detail.commit.commit.committer.date, &Rfc3339)
                .ok()
                .and_then(|committed| {
                    let elapsed = OffsetDateTime::now_utc() - committed;
                    Duration::try_from(elapsed).ok()
                });

            branches.push(RemoteBranchSummary {
                name: detail.name,
                last_commit: detail.commit.sha,
                age,
            });
        }

        Ok(branches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StubRunner {
        calls: Mutex<Vec<Vec<OsString>>>,
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
        fn run(&self, _program: &str, args: &[OsString]) -> io::Result<std::process::Output> {
            self.calls.lock().expect("lock").push(args.to_vec());
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

    fn host(results: Vec<io::Result<std::process::Output>>) -> GhCli<StubRunner> {
        GhCli::with_binary(StubRunner::with_results(results), PathBuf::from("gh"))
    }

    fn remote() -> RemoteId {
        RemoteId::new("acme/widgets")
    }

    const PR_JSON: &str = r#"{
        "number": 42,
        "headRefName": "feature/alpha",
        "state": "OPEN",
        "statusCheckRollup": "SUCCESS",
        "reviewDecision": "APPROVED"
    }"#;

    #[tokio::test]
    async fn default_branch_trims_jq_output() {
        let gh = host(vec![Ok(output_with_status(0, b"main\n", b""))]);

        let name = gh.default_branch(&remote()).await.expect("default branch");
        assert_eq!(name, "main");
    }

    #[tokio::test]
    async fn find_pull_request_parses_json_fields() {
        let gh = host(vec![Ok(output_with_status(0, PR_JSON.as_bytes(), b""))]);

        let pr = gh
            .find_pull_request(&remote(), "feature/alpha")
            .await
            .expect("view")
            .expect("present");
        assert_eq!(pr.number, 42);
        assert_eq!(pr.branch, "feature/alpha");
        assert_eq!(pr.state, PullRequestState::Open);
        assert_eq!(pr.ci, CiState::Passing);
        assert_eq!(pr.review, ReviewState::Approved);
    }

    #[tokio::test]
    async fn find_pull_request_maps_no_pr_to_none() {
        let gh = host(vec![Ok(output_with_status(
            1 << 8,
            b"",
            b"no pull requests found for branch \"feature/alpha\"\n",
        ))]);

        let pr = gh
            .find_pull_request(&remote(), "feature/alpha")
            .await
            .expect("view");
        assert!(pr.is_none());
    }

    #[tokio::test]
    async fn find_pull_request_propagates_other_failures() {
        let gh = host(vec![Ok(output_with_status(
            1 << 8,
            b"",
            b"HTTP 401: authentication required\n",
        ))]);

        let err = gh
            .find_pull_request(&remote(), "feature/alpha")
            .await
            .expect_err("expected failure");
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn create_pull_request_extracts_number_from_url() {
        let gh = host(vec![Ok(output_with_status(
            0,
            b"https://github.com/acme/widgets/pull/7\n",
            b"",
        ))]);

        let number = gh
            .create_pull_request(&remote(), "feature/alpha", "main", "Add alpha")
            .await
            .expect("create");
        assert_eq!(number, 7);
    }

    #[tokio::test]
    async fn list_my_open_pull_requests_resolves_author_first() {
        let list_json = format!("[{PR_JSON}]");
        let gh = host(vec![
            Ok(output_with_status(0, b"octocat\n", b"")),
            Ok(output_with_status(0, list_json.as_bytes(), b"")),
        ]);

        let prs = gh
            .list_my_open_pull_requests(&remote())
            .await
            .expect("list");
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].number, 42);

        let calls = gh.runner.calls.lock().expect("lock");
        assert_eq!(calls[0], GhCli::<StubRunner>::current_user_args());
        assert_eq!(
            calls[1],
            GhCli::<StubRunner>::list_prs_args(&remote(), "octocat")
        );
    }

    #[tokio::test]
    async fn list_my_open_pull_requests_handles_empty_list() {
        let gh = host(vec![
            Ok(output_with_status(0, b"octocat\n", b"")),
            Ok(output_with_status(0, b"[]\n", b"")),
        ]);

        let prs = gh
            .list_my_open_pull_requests(&remote())
            .await
            .expect("list");
        assert!(prs.is_empty());
    }

    #[tokio::test]
    async fn branches_skips_entries_the_api_no_longer_knows() {
        let list_json = format!("[{PR_JSON}]");
        let gh = host(vec![
            Ok(output_with_status(0, b"octocat\n", b"")),
            Ok(output_with_status(0, list_json.as_bytes(), b"")),
            Ok(output_with_status(1 << 8, b"", b"HTTP 404: Not Found\n")),
        ]);

        let branches = gh
            .branches_with_my_open_pull_requests(&remote())
            .await
            .expect("branches");
        assert!(branches.is_empty());
    }

    #[tokio::test]
    async fn branches_carry_commit_and_age() {
        let list_json = format!("[{PR_JSON}]");
        let branch_json = r#"{
            "name": "feature/alpha",
            "commit": {
                "sha": "a1b2c3d4",
                "commit": { "committer": { "date": "2020-01-01T00:00:00Z" } }
            }
        }"#;
        let gh = host(vec![
            Ok(output_with_status(0, b"octocat\n", b"")),
            Ok(output_with_status(0, list_json.as_bytes(), b"")),
            Ok(output_with_status(0, branch_json.as_bytes(), b"")),
        ]);

        let branches = gh
            .branches_with_my_open_pull_requests(&remote())
            .await
            .expect("branches");
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, "feature/alpha");
        assert_eq!(branches[0].last_commit, "a1b2c3d4");
        assert!(branches[0].age.expect("age") > Duration::from_secs(60));
    }

    #[test]
    fn ci_rollup_handles_check_arrays() {
        let passing: serde_json::Value =
            serde_json::json!([{ "conclusion": "SUCCESS" }, { "conclusion": "SUCCESS" }]);
        assert_eq!(normalize_ci_rollup(&passing), CiState::Passing);

        let failing: serde_json::Value =
            serde_json::json!([{ "conclusion": "SUCCESS" }, { "conclusion": "FAILURE" }]);
        assert_eq!(normalize_ci_rollup(&failing), CiState::Failing);

        let pending: serde_json::Value =
            serde_json::json!([{ "conclusion": "SUCCESS" }, { "state": "IN_PROGRESS" }]);
        assert_eq!(normalize_ci_rollup(&pending), CiState::Pending);

        let empty: serde_json::Value = serde_json::json!([]);
        assert_eq!(normalize_ci_rollup(&empty), CiState::Unknown);
    }

    #[test]
    fn review_decision_normalization_matches_gh_vocabulary() {
        assert_eq!(normalize_review_decision("APPROVED"), ReviewState::Approved);
        assert_eq!(
            normalize_review_decision("CHANGES_REQUESTED"),
            ReviewState::ChangesRequested
        );
        assert_eq!(
            normalize_review_decision("REVIEW_REQUIRED"),
            ReviewState::Pending
        );
        assert_eq!(normalize_review_decision(""), ReviewState::Unknown);
    }
}
