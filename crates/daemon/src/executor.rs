// Sync script invocation.
//
// The actual clone/fetch and large-object extraction is done by an external
// script. This module owns how it is invoked and how its single result line
// `<new commit>, <manifest path or empty>, <yes|no>` is parsed. Process
// spawning goes through `CommandExecutor` so tests never fork.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandExecutor: Send + Sync {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
    ) -> Result<CommandResult, std::io::Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandExecutor;

impl CommandExecutor for ProcessCommandExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
    ) -> Result<CommandResult, std::io::Error> {
        // Scripts run unattended; a prompt must fail instead of hanging.
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()?;
        let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();
        Ok(CommandResult {
            success: output.status.success(),
            code: output.status.code(),
            stdout: text(&output.stdout),
            stderr: text(&output.stderr),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("failed to run `{command}`: {message}")]
    SpawnFailed { command: String, message: String },

    #[error("`{command}` failed with code {code:?}: {}", .stderr.trim())]
    CommandFailed { command: String, code: Option<i32>, stderr: String },

    #[error("unparsable sync result `{output}`")]
    Unparsable { output: String },
}

/// Arguments for one sync script run.
#[derive(Debug, Clone)]
pub struct SyncInvocation<'a> {
    pub work_dir: &'a Path,
    /// May embed credentials; never logged or put into error messages.
    pub clone_url: &'a str,
    pub repo_name: &'a str,
    pub tool_path: &'a str,
    pub bucket: &'a str,
    pub destination_prefix: &'a str,
    /// Last recorded commit; empty on a first sync.
    pub start_commit: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub commit: String,
    /// Present when the script reported changed large objects.
    pub manifest: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SyncExecutor<E = ProcessCommandExecutor> {
    script: PathBuf,
    executor: E,
}

impl SyncExecutor<ProcessCommandExecutor> {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self { script: script.into(), executor: ProcessCommandExecutor }
    }
}

impl<E: CommandExecutor> SyncExecutor<E> {
    pub fn with_executor(script: impl Into<PathBuf>, executor: E) -> Self {
        Self { script: script.into(), executor }
    }

    pub fn run(&self, invocation: &SyncInvocation<'_>) -> Result<SyncResult, ExecutorError> {
        let program = self.script.to_string_lossy().into_owned();
        let args = vec![
            invocation.work_dir.to_string_lossy().into_owned(),
            invocation.clone_url.to_string(),
            invocation.repo_name.to_string(),
            invocation.tool_path.to_string(),
            invocation.bucket.to_string(),
            invocation.destination_prefix.to_string(),
            invocation.start_commit.to_string(),
        ];

        let result = self
            .executor
            .execute(&program, &args, invocation.work_dir)
            .map_err(|error| ExecutorError::SpawnFailed {
                command: program.clone(),
                message: error.to_string(),
            })?;

        if !result.success {
            let stderr =
                if result.stderr.trim().is_empty() { result.stdout } else { result.stderr };
            return Err(ExecutorError::CommandFailed { command: program, code: result.code, stderr });
        }

        parse_result_line(&result.stdout, invocation.work_dir)
    }
}

/// Parse the script's result from the last non-empty line of its output.
pub fn parse_result_line(output: &str, work_dir: &Path) -> Result<SyncResult, ExecutorError> {
    let unparsable = || ExecutorError::Unparsable { output: output.trim().to_string() };

    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(unparsable)?;
    let fields: Vec<&str> = line.splitn(3, ',').map(str::trim).collect();
    let &[commit, manifest, has_manifest] = fields.as_slice() else {
        return Err(unparsable());
    };
    if commit.is_empty() {
        return Err(unparsable());
    }

    let manifest = (has_manifest.starts_with("yes") && !manifest.is_empty()).then(|| {
        let path = Path::new(manifest);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            work_dir.join(path)
        }
    });

    Ok(SyncResult { commit: commit.to_string(), manifest })
}
