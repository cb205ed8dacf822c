//! Command execution on remote hosts.
//!
//! Remote access is delegated to the system `ssh` and `scp` binaries; each
//! call blocks until the command finishes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Keep-alive interval passed to ssh, in seconds.
pub const SERVER_ALIVE_INTERVAL: u32 = 600;

/// System ssh client.
pub const SSH_PATH: &str = "/usr/bin/ssh";

/// System scp client.
pub const SCP_PATH: &str = "/usr/bin/scp";

/// Default remote user.
pub const DEFAULT_SSH_USER: &str = "root";

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout of a successful command, or [`Error::CommandFailed`].
    pub fn into_checked(self, host: &str, command: &str) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(Error::CommandFailed {
                host: host.to_string(),
                command: command.to_string(),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run a local program and capture its output.
pub fn run_command<I, S>(program: &str, args: I) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    let label = format!("{:?}", command);
    execute(&mut command, &label)
}

/// Run a prepared command. `label` is what gets logged, so it must not carry
/// secrets passed through the environment.
pub(crate) fn execute(command: &mut Command, label: &str) -> Result<CommandOutput> {
    debug!("calling({})", label);
    let output = command.output().map_err(|e| Error::Spawn {
        command: label.to_string(),
        reason: e.to_string(),
    })?;
    let result = CommandOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    debug!("returncode({:?})", result.status);
    debug!("STDOUT({})", result.stdout);
    debug!("STDERR({})", result.stderr);
    Ok(result)
}

/// Blocking remote shell.
pub trait RemoteShell: Send + Sync {
    /// Run `command` on `host`. A non-zero exit is reported through the
    /// returned [`CommandOutput`], not as an error.
    fn run(&self, host: &str, command: &str) -> Result<CommandOutput>;

    /// Copy `remote_path` from `host` into `local_path`.
    fn fetch(&self, host: &str, remote_path: &str, local_path: &Path) -> Result<()>;
}

/// Connection settings for ssh and scp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshOptions {
    pub user: String,
    pub port: Option<u16>,
    pub key_file: Option<PathBuf>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: DEFAULT_SSH_USER.to_string(),
            port: None,
            key_file: None,
        }
    }
}

impl SshOptions {
    fn destination(&self, host: &str) -> String {
        if self.user.is_empty() {
            host.to_string()
        } else {
            format!("{}@{}", self.user, host)
        }
    }

    fn common_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            args.push(port_flag.to_string());
            args.push(port.to_string());
        }
        if let Some(key) = &self.key_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push("-oStrictHostKeyChecking=no".to_string());
        args.push(format!("-oServerAliveInterval={}", SERVER_ALIVE_INTERVAL));
        args
    }

    /// Arguments for `ssh` running `command` on `host`.
    pub fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        // -n: never read from stdin
        let mut args = vec!["-n".to_string()];
        args.extend(self.common_args("-p"));
        args.push(self.destination(host));
        args.push(command.to_string());
        args
    }

    /// Arguments for `scp` copying `remote_path` from `host` to `local_path`.
    pub fn scp_args(&self, host: &str, remote_path: &str, local_path: &Path) -> Vec<String> {
        let mut args = self.common_args("-P");
        args.push(format!("{}:{}", self.destination(host), remote_path));
        args.push(local_path.display().to_string());
        args
    }
}

/// [`RemoteShell`] backed by the system ssh and scp clients.
#[derive(Debug, Clone, Default)]
pub struct SshShell {
    options: SshOptions,
}

impl SshShell {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
    }
}

impl RemoteShell for SshShell {
    fn run(&self, host: &str, command: &str) -> Result<CommandOutput> {
        let mut ssh = Command::new(SSH_PATH);
        ssh.args(self.options.ssh_args(host, command));
        let label = format!("{:?}", ssh);
        execute(&mut ssh, &label)
    }

    fn fetch(&self, host: &str, remote_path: &str, local_path: &Path) -> Result<()> {
        let mut scp = Command::new(SCP_PATH);
        scp.args(self.options.scp_args(host, remote_path, local_path));
        let label = format!("{:?}", scp);
        execute(&mut scp, &label)?
            .into_checked(host, &format!("scp {}:{}", host, remote_path))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args_defaults() {
        let options = SshOptions::default();
        assert_eq!(
            options.ssh_args("h1", "date"),
            vec![
                "-n",
                "-oStrictHostKeyChecking=no",
                "-oServerAliveInterval=600",
                "root@h1",
                "date",
            ]
        );
    }

    #[test]
    fn test_ssh_args_port_and_key() {
        let options = SshOptions {
            user: "foo".to_string(),
            port: Some(2222),
            key_file: Some(PathBuf::from("/tmp/foobar")),
        };
        let args = options.ssh_args("localhost", "true");
        assert_eq!(&args[..5], &["-n", "-p", "2222", "-i", "/tmp/foobar"]);
        assert!(args.contains(&"foo@localhost".to_string()));
    }

    #[test]
    fn test_scp_uses_uppercase_port_flag() {
        let options = SshOptions {
            user: String::new(),
            port: Some(22),
            key_file: None,
        };
        let args = options.scp_args("h1", "/var/tmp/report.tar.xz", Path::new("/tmp/out"));
        assert_eq!(&args[..2], &["-P", "22"]);
        assert_eq!(args[args.len() - 2], "h1:/var/tmp/report.tar.xz");
        assert_eq!(args[args.len() - 1], "/tmp/out");
    }

    #[test]
    fn test_into_checked() {
        let ok = CommandOutput {
            status: Some(0),
            stdout: "out".into(),
            stderr: String::new(),
        };
        assert_eq!(ok.into_checked("h1", "true").unwrap(), "out");

        let failed = CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: "boom\n".into(),
        };
        let err = failed.into_checked("h1", "false").unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
