//! Remote file operations against a participant host.

use std::{net::Ipv6Addr, path::Path, process::Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::{inventory::Participant, settings::SshSettings};

/// Exit status OpenSSH uses for its own failures (connection refused, authentication, ...).
const SSH_FAILURE: i32 = 255;

#[derive(Debug, Error)]
/// Failure of a single remote operation. Any of them fails the current attempt.
pub enum TransferError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot reach {host}: {stderr}")]
    Unreachable { host: String, stderr: String },
    #[error("{action} failed with {}: {stderr}", exit_text(.code))]
    Remote {
        action: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("unexpected output of {action}: {output:?}")]
    UnexpectedOutput {
        action: &'static str,
        output: String,
    },
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("run deadline elapsed")]
    Deadline,
}

fn exit_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// The remote file operations a delivery is made of.
///
/// Remote paths are absolute POSIX paths on the participant host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Creates `dir` on the host. With `replace` set, any previous content is deleted first.
    async fn prepare_dir(
        &self,
        host: &Participant,
        dir: &str,
        replace: bool,
    ) -> Result<(), TransferError>;

    /// Copies the local file to `remote`, overwriting it.
    async fn upload(
        &self,
        host: &Participant,
        local: &Path,
        remote: &str,
    ) -> Result<(), TransferError>;

    /// Hex encoded SHA-256 of the remote file.
    async fn checksum(&self, host: &Participant, remote: &str) -> Result<String, TransferError>;

    /// Atomically renames `from` to `to` on the host.
    async fn promote(&self, host: &Participant, from: &str, to: &str)
        -> Result<(), TransferError>;

    /// Removes the remote file, if present.
    async fn discard(&self, host: &Participant, remote: &str) -> Result<(), TransferError>;
}

/// Quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A [`Transport`] driving the OpenSSH `ssh` and `scp` clients.
///
/// Host keys and authentication are left to the user's OpenSSH configuration; the clients run in
/// batch mode, so a host asking for a password fails instead of blocking the run.
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    ssh_program: String,
    scp_program: String,
    connect_timeout: u64,
}

impl OpenSshTransport {
    pub fn new(settings: &SshSettings) -> Self {
        Self {
            ssh_program: settings.ssh_program.clone(),
            scp_program: settings.scp_program.clone(),
            connect_timeout: settings.connect_timeout,
        }
    }

    fn common_args(&self, host: &Participant, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
        ];
        if let Some(port) = host.port {
            args.push(port_flag.to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &host.auth.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn target(host: &Participant, address: &str) -> String {
        match &host.auth.user {
            Some(user) => format!("{}@{}", user, address),
            None => address.to_string(),
        }
    }

    /// `scp` splits its target at the first colon, IPv6 literals have to be bracketed.
    fn scp_target(host: &Participant, remote: &str) -> String {
        let address = match host.host_address.parse::<Ipv6Addr>() {
            Ok(_) => format!("[{}]", host.host_address),
            Err(_) => host.host_address.clone(),
        };
        format!("{}:{}", Self::target(host, &address), remote)
    }

    fn ssh_args(&self, host: &Participant, command: &str) -> Vec<String> {
        let mut args = self.common_args(host, "-p");
        args.push("--".to_string());
        args.push(Self::target(host, &host.host_address));
        args.push(command.to_string());
        args
    }

    fn scp_args(&self, host: &Participant, local: &Path, remote: &str) -> Vec<String> {
        let mut args = self.common_args(host, "-P");
        args.push("-q".to_string());
        args.push("--".to_string());
        args.push(local.display().to_string());
        args.push(Self::scp_target(host, remote));
        args
    }

    async fn run(
        &self,
        program: &str,
        args: Vec<String>,
        host: &Participant,
        action: &'static str,
    ) -> Result<String, TransferError> {
        debug!("{} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TransferError::Launch {
                program: program.to_string(),
                source,
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(SSH_FAILURE) => Err(TransferError::Unreachable {
                host: host.host_address.clone(),
                stderr,
            }),
            code => Err(TransferError::Remote {
                action,
                code,
                stderr,
            }),
        }
    }

    async fn ssh(
        &self,
        host: &Participant,
        command: &str,
        action: &'static str,
    ) -> Result<String, TransferError> {
        let args = self.ssh_args(host, command);
        self.run(&self.ssh_program, args, host, action).await
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    async fn prepare_dir(
        &self,
        host: &Participant,
        dir: &str,
        replace: bool,
    ) -> Result<(), TransferError> {
        let dir = shell_quote(dir);
        let command = if replace {
            format!("rm -rf -- {dir} && mkdir -p -- {dir}", dir = dir)
        } else {
            format!("mkdir -p -- {}", dir)
        };
        self.ssh(host, &command, "mkdir").await.map(|_| ())
    }

    async fn upload(
        &self,
        host: &Participant,
        local: &Path,
        remote: &str,
    ) -> Result<(), TransferError> {
        let args = self.scp_args(host, local, remote);
        self.run(&self.scp_program, args, host, "scp")
            .await
            .map(|_| ())
    }

    async fn checksum(&self, host: &Participant, remote: &str) -> Result<String, TransferError> {
        let command = format!("sha256sum -- {}", shell_quote(remote));
        let output = self.ssh(host, &command, "sha256sum").await?;
        parse_sha256sum(&output).ok_or(TransferError::UnexpectedOutput {
            action: "sha256sum",
            output,
        })
    }

    async fn promote(
        &self,
        host: &Participant,
        from: &str,
        to: &str,
    ) -> Result<(), TransferError> {
        let command = format!("mv -f -- {} {}", shell_quote(from), shell_quote(to));
        self.ssh(host, &command, "mv").await.map(|_| ())
    }

    async fn discard(&self, host: &Participant, remote: &str) -> Result<(), TransferError> {
        let command = format!("rm -f -- {}", shell_quote(remote));
        self.ssh(host, &command, "rm").await.map(|_| ())
    }
}

/// Extracts the digest from a `sha256sum` line (`<hex>  <path>`).
fn parse_sha256sum(output: &str) -> Option<String> {
    let digest = output.split_whitespace().next()?;
    // sha256sum escapes names with backslashes and marks such lines with a leading `\`
    let digest = digest.trim_start_matches('\\');
    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::inventory::AuthRef;

    fn host(port: Option<u16>, user: Option<&str>, key: Option<&str>) -> Participant {
        Participant {
            site_name: "site-1".to_string(),
            host_address: "10.0.0.11".to_string(),
            port,
            auth: AuthRef {
                user: user.map(String::from),
                identity_file: key.map(PathBuf::from),
            },
        }
    }

    fn transport() -> OpenSshTransport {
        OpenSshTransport::new(&SshSettings::default())
    }

    #[test]
    fn test_ssh_args() {
        let args = transport().ssh_args(
            &host(Some(2222), Some("fl"), Some("/keys/id")),
            "mkdir -p -- '/data'",
        );
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "-p",
                "2222",
                "-i",
                "/keys/id",
                "--",
                "fl@10.0.0.11",
                "mkdir -p -- '/data'",
            ]
        );
    }

    #[test]
    fn test_scp_args() {
        let args = transport().scp_args(
            &host(Some(2222), None, None),
            Path::new("/staging/site-1_train.shard"),
            "/data/site-1_train.shard.partial",
        );
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "-P",
                "2222",
                "-q",
                "--",
                "/staging/site-1_train.shard",
                "10.0.0.11:/data/site-1_train.shard.partial",
            ]
        );
    }

    #[test]
    fn test_scp_args_bracket_ipv6_hosts() {
        let mut ipv6 = host(None, Some("fl"), None);
        ipv6.host_address = "2001:db8::5".to_string();
        let args = transport().scp_args(
            &ipv6,
            Path::new("/staging/site-1_train.shard"),
            "/data/site-1_train.shard.partial",
        );
        assert_eq!(
            args.last().unwrap(),
            "fl@[2001:db8::5]:/data/site-1_train.shard.partial"
        );

        // ssh takes the bare address
        let args = transport().ssh_args(&ipv6, "true");
        assert!(args.contains(&"fl@2001:db8::5".to_string()));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/fl"), "'/data/fl'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_parse_sha256sum() {
        let digest = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        assert_eq!(
            parse_sha256sum(&format!("{}  /data/x.shard\n", digest)),
            Some(digest.to_string())
        );
        assert_eq!(
            parse_sha256sum(&format!("{}  /data/x.shard", digest.to_uppercase())),
            Some(digest.to_string())
        );
        assert_eq!(parse_sha256sum("sha256sum: /data/x: No such file"), None);
        assert_eq!(parse_sha256sum(""), None);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_launch() {
        let transport = OpenSshTransport::new(&SshSettings {
            ssh_program: "/nonexistent/ssh".to_string(),
            scp_program: "/nonexistent/scp".to_string(),
            connect_timeout: 1,
        });
        let host = host(None, None, None);
        assert!(matches!(
            transport.prepare_dir(&host, "/data", false).await,
            Err(TransferError::Launch { .. })
        ));
        assert!(matches!(
            transport
                .upload(&host, Path::new("/staging/x"), "/data/x")
                .await,
            Err(TransferError::Launch { .. })
        ));
    }
}
