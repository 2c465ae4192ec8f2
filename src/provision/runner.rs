use crate::config::schema::ProvisionConfig;
use std::io;
use std::path::Path;
use std::process::Command;

/// Exit status of a finished command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    /// `None` when the process was terminated by a signal
    pub code: Option<i32>,
}

impl CommandStatus {
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Runs shell command lines
///
/// `Err` means the command could not be started at all; a started command
/// that fails is reported through `CommandStatus`.
pub trait CommandRunner {
    fn run(
        &self,
        command: &str,
        working_dir: &Path,
        env: &[(String, String)],
    ) -> io::Result<CommandStatus>;
}

/// Runs commands through `<shell> -c`, inheriting stdio
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    #[must_use]
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &ProvisionConfig) -> Self {
        Self::new(config.shell.clone())
    }

    fn command_flag(&self) -> &'static str {
        let name = Path::new(&self.shell)
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name == "cmd" {
            "/C"
        } else {
            "-c"
        }
    }
}

impl CommandRunner for ShellRunner {
    fn run(
        &self,
        command: &str,
        working_dir: &Path,
        env: &[(String, String)],
    ) -> io::Result<CommandStatus> {
        tracing::debug!("Running `{command}` in {}", working_dir.display());

        let status = Command::new(&self.shell)
            .arg(self.command_flag())
            .arg(command)
            .current_dir(working_dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .status()?;

        Ok(CommandStatus {
            code: status.code(),
        })
    }
}

/// Quote a single argument for a POSIX shell command line
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:+@,%".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}
