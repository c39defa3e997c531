use std::path::PathBuf;

use tokio::process::Command;

use crate::{Transport, TransportError, TransportKind};

/// Runs commands on a remote host through the `ssh` client using key auth
#[derive(Clone, Debug)]
pub struct RemoteShell {
    host: String,
    port: u16,
    user: String,
    key_path: PathBuf,
    connect_timeout_secs: u32,
}

impl RemoteShell {
    pub fn new(host: impl Into<String>, user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            key_path: key_path.into(),
            connect_timeout_secs: 5,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, secs: u32) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Arguments passed to `ssh` for a command line
    fn args(&self, command_line: &str) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-p".to_string(),
            self.port.to_string(),
            "-i".to_string(),
            self.key_path.to_string_lossy().into_owned(),
            format!("{}@{}", self.user, self.host),
            command_line.to_string(),
        ]
    }
}

impl Transport for RemoteShell {
    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }

    fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    fn command(&self, command_line: &str) -> Result<Command, TransportError> {
        if self.user.is_empty() || self.host.is_empty() {
            return Err(TransportError::NotConfigured(
                "SSH username or server address not set".to_string(),
            ));
        }
        if !self.key_path.is_file() {
            return Err(TransportError::NotConfigured(format!(
                "SSH private key file not found at {}",
                self.key_path.display()
            )));
        }

        let mut command = Command::new("ssh");
        command.args(self.args(command_line));
        Ok(command)
    }

    fn verify_hint(&self) -> &'static str {
        "check the SSH user and private key, that sshd is running on the target, \
         and try `ssh -i <key> <user>@<host>` manually"
    }
}
