use tokio::process::Command;

use crate::{Transport, TransportError, TransportKind};

/// Windows `CREATE_NO_WINDOW`, keeps `wsl.exe` from flashing a console
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Runs commands inside a local WSL distribution through `wsl.exe`
#[derive(Clone, Debug)]
pub struct VirtualizedShell {
    distribution: String,
    user: String,
}

impl VirtualizedShell {
    pub fn new(distribution: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            distribution: distribution.into(),
            user: user.into(),
        }
    }

    fn args(&self, command_line: &str) -> Vec<String> {
        vec![
            "-d".to_string(),
            self.distribution.clone(),
            "-u".to_string(),
            self.user.clone(),
            "--exec".to_string(),
            "bash".to_string(),
            "-l".to_string(),
            "-c".to_string(),
            command_line.to_string(),
        ]
    }
}

impl Transport for VirtualizedShell {
    fn kind(&self) -> TransportKind {
        TransportKind::Virtualized
    }

    fn target(&self) -> String {
        format!("{} as {}", self.distribution, self.user)
    }

    fn command(&self, command_line: &str) -> Result<Command, TransportError> {
        if self.user.is_empty() {
            return Err(TransportError::NotConfigured(format!(
                "no {} username set",
                self.distribution
            )));
        }

        let mut command = Command::new("wsl.exe");
        command.args(self.args(command_line));
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);
        Ok(command)
    }

    fn verify_hint(&self) -> &'static str {
        "check that the WSL distribution is installed and the configured user exists in it"
    }
}
