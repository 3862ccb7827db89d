use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;
use yard_core::{CoreError, RemoteEnvironment};

const ENV_DEVBOX_BIN: &str = "YARD_DEVBOX_BIN";

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

/// [`RemoteEnvironment`] over the devbox CLI, which fronts the cluster that
/// hosts remote development environments. Existence and status both go
/// through `devbox list --json` rather than per-name subcommands.
pub struct DevboxCli<R: CommandRunner> {
    runner: R,
    binary: PathBuf,
}

#[derive(Debug, Deserialize)]
struct DevboxEntry {
    name: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    devboxes: Vec<DevboxEntry>,
}

impl<R: CommandRunner> DevboxCli<R> {
    pub fn new(runner: R) -> Result<Self, CoreError> {
        let binary = std::env::var_os(ENV_DEVBOX_BIN)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("devbox"));
        if binary.as_os_str().is_empty() {
            return Err(CoreError::Configuration(format!(
                "{ENV_DEVBOX_BIN} is set but empty. Provide a valid devbox binary path or unset it."
            )));
        }

        Ok(Self::with_binary(runner, binary))
    }

    pub fn with_binary(runner: R, binary: PathBuf) -> Self {
        Self { runner, binary }
    }

    fn create_args(name: &str, repo_url: &str, branch: &str) -> Vec<OsString> {
        vec![
            OsString::from("create"),
            OsString::from("--name"),
            OsString::from(name),
            OsString::from("--repo"),
            OsString::from(repo_url),
            OsString::from("--branch"),
            OsString::from(branch),
        ]
    }

    fn delete_args(name: &str) -> Vec<OsString> {
        vec![OsString::from("delete"), OsString::from(name)]
    }

    fn list_args() -> Vec<OsString> {
        vec![OsString::from("list"), OsString::from("--json")]
    }

    fn ssh_command_args(name: &str) -> Vec<OsString> {
        vec![OsString::from("ssh-command"), OsString::from(name)]
    }

    fn run_devbox_raw(&self, args: &[OsString]) -> Result<std::process::Output, CoreError> {
        let program = self
            .binary
            .to_str()
            .ok_or_else(|| CoreError::Configuration("Invalid devbox binary path".to_owned()))?;
        self.runner
            .run(program, args)
            .map_err(|error| match error.kind() {
                io::ErrorKind::NotFound => CoreError::DependencyUnavailable(format!(
                    "devbox CLI `{}` was not found. Install it or set {ENV_DEVBOX_BIN} to a valid binary path.",
                    self.binary.display()
                )),
                _ => CoreError::DependencyUnavailable(format!(
                    "Failed to execute devbox CLI `{}`: {error}",
                    self.binary.display()
                )),
            })
    }

    fn run_devbox(&self, args: &[OsString]) -> Result<std::process::Output, CoreError> {
        let output = self.run_devbox_raw(args)?;
        if output.status.success() {
            return Ok(output);
        }

        Err(self.command_failed(args, &output))
    }

    fn command_failed(&self, args: &[OsString], output: &std::process::Output) -> CoreError {
        CoreError::DependencyUnavailable(format!(
            "devbox command failed (`{} {}`): {}",
            self.binary.display(),
            args.iter()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join(" "),
            Self::command_output_detail(output)
        ))
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

    fn list(&self) -> Result<Vec<DevboxEntry>, CoreError> {
        let args = Self::list_args();
        let output = self.run_devbox_raw(&args)?;
        if !output.status.success() {
            // Some CLI builds exit non-zero when nothing is provisioned.
            if Self::command_output_detail(&output).contains("no devboxes") {
                return Ok(Vec::new());
            }
            return Err(self.command_failed(&args, &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if stdout.is_empty() {
            return Ok(Vec::new());
        }

        let response: ListResponse = serde_json::from_str(&stdout).map_err(|error| {
            CoreError::DependencyUnavailable(format!(
                "Failed to parse devbox list output: {error}"
            ))
        })?;
        Ok(response.devboxes)
    }
}

#[async_trait::async_trait]
impl<R: CommandRunner> RemoteEnvironment for DevboxCli<R> {
    async fn create(&self, name: &str, repo_url: &str, branch: &str) -> Result<(), CoreError> {
        self.run_devbox(&Self::create_args(name, repo_url, branch))
            .map(|_| ())
    }

    async fn delete(&self, name: &str) -> Result<(), CoreError> {
        self.run_devbox(&Self::delete_args(name)).map(|_| ())
    }

    async fn exists(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self.list()?.iter().any(|entry| entry.name == name))
    }

    async fn connection_command(&self, name: &str) -> Result<String, CoreError> {
        let output = self.run_devbox(&Self::ssh_command_args(name))?;
        let command = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if command.is_empty() {
            return Err(CoreError::DependencyUnavailable(format!(
                "devbox reported no connection command for `{name}`."
            )));
        }
        Ok(command)
    }

    async fn status(&self, name: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.status))
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

    fn provider(results: Vec<io::Result<std::process::Output>>) -> DevboxCli<StubRunner> {
        DevboxCli::with_binary(StubRunner::with_results(results), PathBuf::from("devbox"))
    }

    const LIST_JSON: &[u8] =
        br#"{"devboxes": [{"name": "feature-alpha", "status": "running"}]}"#;

    #[tokio::test]
    async fn create_passes_name_repo_and_branch() {
        let devbox = provider(vec![Ok(output_with_status(0, b"", b""))]);
        devbox
            .create("feature-alpha", "git@github.com:acme/widgets.git", "feature/alpha")
            .await
            .expect("create");

        let calls = devbox.runner.calls.lock().expect("lock");
        assert_eq!(
            calls[0],
            DevboxCli::<StubRunner>::create_args(
                "feature-alpha",
                "git@github.com:acme/widgets.git",
                "feature/alpha"
            )
        );
    }

    #[tokio::test]
    async fn exists_searches_the_listing() {
        let devbox = provider(vec![
            Ok(output_with_status(0, LIST_JSON, b"")),
            Ok(output_with_status(0, LIST_JSON, b"")),
        ]);

        assert!(devbox.exists("feature-alpha").await.expect("exists"));
        assert!(!devbox.exists("feature-beta").await.expect("exists"));
    }

    #[tokio::test]
    async fn empty_listing_means_nothing_exists() {
        let devbox = provider(vec![Ok(output_with_status(0, b"", b""))]);

        assert!(!devbox.exists("feature-alpha").await.expect("exists"));
    }

    #[tokio::test]
    async fn no_devboxes_error_is_treated_as_empty() {
        let devbox = provider(vec![Ok(output_with_status(
            1 << 8,
            b"",
            b"error: no devboxes found\n",
        ))]);

        assert!(!devbox.exists("feature-alpha").await.expect("exists"));
    }

    #[tokio::test]
    async fn status_is_none_for_unknown_environments() {
        let devbox = provider(vec![
            Ok(output_with_status(0, LIST_JSON, b"")),
            Ok(output_with_status(0, LIST_JSON, b"")),
        ]);

        assert_eq!(
            devbox.status("feature-alpha").await.expect("status").as_deref(),
            Some("running")
        );
        assert!(devbox.status("feature-beta").await.expect("status").is_none());
    }

    #[tokio::test]
    async fn connection_command_trims_output() {
        let devbox = provider(vec![Ok(output_with_status(
            0,
            b"ssh -i /keys/dev user@devbox-feature-alpha\n",
            b"",
        ))]);

        let command = devbox
            .connection_command("feature-alpha")
            .await
            .expect("command");
        assert_eq!(command, "ssh -i /keys/dev user@devbox-feature-alpha");
    }

    #[tokio::test]
    async fn connection_command_requires_output() {
        let devbox = provider(vec![Ok(output_with_status(0, b"", b""))]);

        let err = devbox
            .connection_command("feature-alpha")
            .await
            .expect_err("expected error");
        assert!(err.to_string().contains("no connection command"));
    }

    #[tokio::test]
    async fn missing_binary_is_actionable() {
        let devbox = provider(vec![Err(io::Error::new(io::ErrorKind::NotFound, "missing"))]);

        let err = devbox
            .delete("feature-alpha")
            .await
            .expect_err("expected error");
        assert!(err.to_string().contains(ENV_DEVBOX_BIN));
    }
}
