//! Remote-shell transport.
//!
//! Runs the tool server on a remote host through an `ssh` channel and
//! reuses the pipe-style client over the ssh process's stdio. `BatchMode`
//! keeps the channel non-interactive so a missing key fails fast instead
//! of prompting.

use std::{path::PathBuf, time::Duration};

use super::process::{CommandSpec, ProcessClient};

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
    /// Command executed on the remote host; must speak JSON-RPC on stdio.
    pub command: String,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn argv(&self) -> Vec<String> {
        let mut argv = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(port) = self.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        if let Some(identity) = &self.identity {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }
        argv.push(self.destination());
        argv.push(self.command.clone());
        argv
    }
}

/// Build a pipe-style client tunnelled through `ssh`.
pub fn ssh_client(
    name: impl Into<String>,
    target: &SshTarget,
    request_timeout: Duration,
) -> ProcessClient {
    let spec = CommandSpec::new("ssh").with_args(target.argv());
    ProcessClient::new(name, spec, request_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_includes_port_identity_and_destination() {
        let target = SshTarget {
            host: "tools.internal".to_string(),
            user: Some("svc".to_string()),
            port: Some(2222),
            identity: Some(PathBuf::from("/etc/keys/id_ed25519")),
            command: "run-tool-server --stdio".to_string(),
        };
        assert_eq!(
            target.argv(),
            vec![
                "-o",
                "BatchMode=yes",
                "-p",
                "2222",
                "-i",
                "/etc/keys/id_ed25519",
                "svc@tools.internal",
                "run-tool-server --stdio",
            ]
        );
    }

    #[test]
    fn argv_minimal_target() {
        let target = SshTarget {
            host: "tools.internal".to_string(),
            user: None,
            port: None,
            identity: None,
            command: "server".to_string(),
        };
        assert_eq!(
            target.argv(),
            vec!["-o", "BatchMode=yes", "tools.internal", "server"]
        );
    }
}
