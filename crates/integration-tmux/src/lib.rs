use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use yard_core::{CoreError, TerminalMultiplexer};

const ENV_TMUX_BIN: &str = "YARD_TMUX_BIN";

pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<std::process::Output>;

    /// Run with the caller's stdio attached. Used for `attach-session`,
    /// which takes over the terminal until the user detaches.
    fn run_interactive(&self, program: &str, args: &[OsString]) -> io::Result<ExitStatus>;
}

#[derive(Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<std::process::Output> {
        Command::new(program).args(args).output()
    }

    fn run_interactive(&self, program: &str, args: &[OsString]) -> io::Result<ExitStatus> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
    }
}

/// [`TerminalMultiplexer`] over the tmux CLI. Window targets are rendered
/// as `session:window`, which is why window names must never contain `:`
/// or `.` (see the window naming rules in `yard_core::slug`).
pub struct TmuxCli<R: CommandRunner> {
    runner: R,
    binary: PathBuf,
}

impl<R: CommandRunner> TmuxCli<R> {
    pub fn new(runner: R) -> Result<Self, CoreError> {
        let binary = std::env::var_os(ENV_TMUX_BIN)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("tmux"));
        if binary.as_os_str().is_empty() {
            return Err(CoreError::Configuration(format!(
                "{ENV_TMUX_BIN} is set but empty. Provide a valid tmux binary path or unset it."
            )));
        }

        Ok(Self::with_binary(runner, binary))
    }

    pub fn with_binary(runner: R, binary: PathBuf) -> Self {
        Self { runner, binary }
    }

    fn target(session: &str, window: &str) -> String {
        format!("{session}:{window}")
    }

    fn has_session_args(name: &str) -> Vec<OsString> {
        vec![
            OsString::from("has-session"),
            OsString::from("-t"),
            OsString::from(name),
        ]
    }

    fn new_session_args(name: &str) -> Vec<OsString> {
        vec![
            OsString::from("new-session"),
            OsString::from("-d"),
            OsString::from("-s"),
            OsString::from(name),
        ]
    }

    fn list_windows_args(session: &str) -> Vec<OsString> {
        vec![
            OsString::from("list-windows"),
            OsString::from("-t"),
            OsString::from(session),
            OsString::from("-F"),
            OsString::from("#{window_name}"),
        ]
    }

    fn new_window_args(session: &str, window: &str, start_dir: Option<&Path>) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("new-window"),
            OsString::from("-t"),
            OsString::from(session),
            OsString::from("-n"),
            OsString::from(window),
        ];
        if let Some(dir) = start_dir {
            args.push(OsString::from("-c"));
            args.push(dir.as_os_str().to_owned());
        }
        args
    }

    fn send_keys_args(session: &str, window: &str, command: &str) -> Vec<OsString> {
        vec![
            OsString::from("send-keys"),
            OsString::from("-t"),
            OsString::from(Self::target(session, window)),
            OsString::from(command),
            OsString::from("Enter"),
        ]
    }

    fn switch_client_args(session: &str, window: &str) -> Vec<OsString> {
        vec![
            OsString::from("switch-client"),
            OsString::from("-t"),
            OsString::from(Self::target(session, window)),
        ]
    }

    fn select_window_args(session: &str, window: &str) -> Vec<OsString> {
        vec![
            OsString::from("select-window"),
            OsString::from("-t"),
            OsString::from(Self::target(session, window)),
        ]
    }

    fn attach_session_args(session: &str) -> Vec<OsString> {
        vec![
            OsString::from("attach-session"),
            OsString::from("-t"),
            OsString::from(session),
        ]
    }

    fn program(&self) -> Result<&str, CoreError> {
        self.binary
            .to_str()
            .ok_or_else(|| CoreError::Configuration("Invalid tmux binary path".to_owned()))
    }

    fn run_tmux_raw(&self, args: &[OsString]) -> Result<std::process::Output, CoreError> {
        let program = self.program()?;
        self.runner
            .run(program, args)
            .map_err(|error| match error.kind() {
                io::ErrorKind::NotFound => CoreError::DependencyUnavailable(format!(
                    "tmux `{}` was not found. Install tmux or set {ENV_TMUX_BIN} to a valid binary path.",
                    self.binary.display()
                )),
                _ => CoreError::DependencyUnavailable(format!(
                    "Failed to execute tmux `{}`: {error}",
                    self.binary.display()
                )),
            })
    }

    fn run_tmux(&self, args: &[OsString]) -> Result<std::process::Output, CoreError> {
        let output = self.run_tmux_raw(args)?;
        if output.status.success() {
            return Ok(output);
        }

        Err(self.command_failed(args, &output))
    }

    fn command_failed(&self, args: &[OsString], output: &std::process::Output) -> CoreError {
        CoreError::DependencyUnavailable(format!(
            "tmux command failed (`{} {}`): {}",
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
}

#[async_trait::async_trait]
impl<R: CommandRunner> TerminalMultiplexer for TmuxCli<R> {
    async fn session_exists(&self, name: &str) -> Result<bool, CoreError> {
        // has-session exits 1 when the session (or the server) is absent.
        let output = self.run_tmux_raw(&Self::has_session_args(name))?;
        Ok(output.status.success())
    }

    async fn create_session(&self, name: &str) -> Result<(), CoreError> {
        self.run_tmux(&Self::new_session_args(name)).map(|_| ())
    }

    async fn window_exists(&self, session: &str, window: &str) -> Result<bool, CoreError> {
        let args = Self::list_windows_args(session);
        let output = self.run_tmux_raw(&args)?;
        if !output.status.success() {
            if Self::command_output_detail(&output).contains("can't find session") {
                return Ok(false);
            }
            return Err(self.command_failed(&args, &output));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|name| name == window))
    }

    async fn create_window(
        &self,
        session: &str,
        window: &str,
        start_dir: Option<&Path>,
    ) -> Result<(), CoreError> {
        self.run_tmux(&Self::new_window_args(session, window, start_dir))
            .map(|_| ())
    }

    async fn run_in_window(
        &self,
        session: &str,
        window: &str,
        command: &str,
    ) -> Result<(), CoreError> {
        self.run_tmux(&Self::send_keys_args(session, window, command))
            .map(|_| ())
    }

    async fn switch_to_window(&self, session: &str, window: &str) -> Result<(), CoreError> {
        self.run_tmux(&Self::switch_client_args(session, window))
            .map(|_| ())
    }

    async fn select_window(&self, session: &str, window: &str) -> Result<(), CoreError> {
        self.run_tmux(&Self::select_window_args(session, window))
            .map(|_| ())
    }

    async fn attach_session(&self, session: &str) -> Result<(), CoreError> {
        let program = self.program()?.to_owned();
        let args = Self::attach_session_args(session);
        let status = self
            .runner
            .run_interactive(&program, &args)
            .map_err(|error| {
                CoreError::DependencyUnavailable(format!(
                    "Failed to attach to tmux session `{session}`: {error}"
                ))
            })?;
        if !status.success() {
            return Err(CoreError::DependencyUnavailable(format!(
                "tmux attach-session exited with {status}."
            )));
        }
        Ok(())
    }

    fn inside_multiplexer(&self) -> bool {
        std::env::var_os("TMUX").is_some_and(|value| !value.is_empty())
    }
}
