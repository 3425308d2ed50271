//! Launching the external tools the workflow is built from.
//!
//! Two shapes exist: a line-oriented interpreter fed through standard input
//! (diskpart) and a plain command line (defrag). Both block until the child
//! exits. A child that cannot be started is reported as an invoker fault,
//! never as a tool exit code.

use crate::CompactError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

/// Appended to every script so the interpreter terminates.
pub const EXIT_COMMAND: &str = "exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub output: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait::async_trait]
pub trait ToolRunner: Send + Sync {
    /// Feed `commands` (followed by `exit`) to `program` one per line and
    /// capture its standard output.
    async fn run_script(&self, program: &Path, commands: &[String]) -> Result<CommandResult, CompactError>;

    /// Run `program` with a single flattened argument string.
    async fn run_args(&self, program: &Path, args: &str) -> Result<i32, CompactError>;
}

/// Runs tools as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    fn resolve(program: &Path) -> Result<PathBuf, CompactError> {
        if program.is_absolute() || program.components().count() > 1 {
            return Ok(program.to_path_buf());
        }
        which::which(program).map_err(|e| {
            CompactError::ToolNotFound(format!("{} ({})", program.display(), e))
        })
    }

    fn launch_failed(program: &Path, source: std::io::Error) -> CompactError {
        CompactError::LaunchFailed {
            tool: program.display().to_string(),
            source,
        }
    }

    fn exit_code(program: &Path, status: std::process::ExitStatus) -> Result<i32, CompactError> {
        status
            .code()
            .ok_or_else(|| CompactError::ToolTerminated(program.display().to_string()))
    }
}

#[async_trait::async_trait]
impl ToolRunner for ProcessRunner {
    async fn run_script(&self, program: &Path, commands: &[String]) -> Result<CommandResult, CompactError> {
        let resolved = Self::resolve(program)?;
        let mut cmd = Command::new(&resolved);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Self::launch_failed(program, e))?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            Self::launch_failed(
                program,
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "standard input was not captured"),
            )
        })?;

        let mut script = String::new();
        for command in commands.iter().map(String::as_str).chain([EXIT_COMMAND]) {
            tracing::debug!("{} < {}", program.display(), command);
            script.push_str(command);
            script.push_str(LINE_ENDING);
        }
        stdin.write_all(script.as_bytes()).await?;
        stdin.flush().await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        let exit_code = Self::exit_code(program, output.status)?;
        let output = String::from_utf8_lossy(&output.stdout).into_owned();

        tracing::debug!("{} exited with {}", program.display(), exit_code);
        tracing::trace!("{} output:\n{}", program.display(), output);

        Ok(CommandResult { exit_code, output })
    }

    async fn run_args(&self, program: &Path, args: &str) -> Result<i32, CompactError> {
        let resolved = Self::resolve(program)?;
        let mut std_cmd = std::process::Command::new(&resolved);

        // defrag parses its own command line, so it is passed through untouched
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            std_cmd.raw_arg(args);
        }
        #[cfg(not(windows))]
        {
            std_cmd.args(args.split_whitespace());
        }
        let mut cmd = Command::from(std_cmd);

        tracing::debug!("Running {} {}", program.display(), args);
        let status = cmd
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| Self::launch_failed(program, e))?;

        let exit_code = Self::exit_code(program, status)?;
        tracing::debug!("{} exited with {}", program.display(), exit_code);
        Ok(exit_code)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn commands(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn script_reaches_tool_in_order_followed_by_exit() {
        // `cat` echoes its script back, so the output is what the tool saw.
        let result = ProcessRunner
            .run_script(Path::new("cat"), &commands(&["c1", "c2", "c3"]))
            .await
            .unwrap();

        assert!(result.success());
        let seen: Vec<&str> = result.output.lines().collect();
        assert_eq!(seen, vec!["c1", "c2", "c3", "exit"]);
    }

    #[tokio::test]
    async fn empty_script_still_sends_exit() {
        let result = ProcessRunner.run_script(Path::new("cat"), &[]).await.unwrap();
        assert_eq!(result.output.lines().collect::<Vec<_>>(), vec!["exit"]);
    }

    #[tokio::test]
    async fn argument_invocation_reports_exit_code() {
        assert_eq!(ProcessRunner.run_args(Path::new("true"), "").await.unwrap(), 0);
        assert_ne!(ProcessRunner.run_args(Path::new("false"), "").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_tool_is_an_invoker_fault() {
        let err = ProcessRunner
            .run_script(Path::new("definitely-not-a-real-tool-4711"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CompactError::ToolNotFound(_)));
        assert!(err.is_invoker_fault());

        let err = ProcessRunner
            .run_args(Path::new("/nonexistent/dir/defrag"), "D: /U")
            .await
            .unwrap_err();
        assert!(matches!(err, CompactError::LaunchFailed { .. }));
        assert!(err.is_invoker_fault());
    }
}
