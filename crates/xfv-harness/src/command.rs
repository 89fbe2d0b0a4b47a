//! External command invocation behind a trait, so text parsers can be fed
//! canned output in tests.

use std::ffi::OsStr;
use std::process::{Command, Stdio};
use tracing::debug;
use xfv_error::Result;

/// Captured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs `program args...` to completion and captures its output.
///
/// Spawn failures are `XfvError::Io`; a non-zero exit is not an error at
/// this layer.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[&OsStr]) -> Result<CommandOutput>;
}

/// `std::process::Command` backed runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&OsStr]) -> Result<CommandOutput> {
        debug!(program, ?args, "running command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, program: &str, args: &[&OsStr]) -> Result<CommandOutput> {
        (**self).run(program, args)
    }
}

/// Whether `cmd` resolves on `PATH`.
#[must_use]
pub fn command_available(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
