//! Controller configuration.
//!
//! All settings are supplied on the command line or via environment
//! variables (so the controller can run unattended under a process
//! supervisor). Validation failures are fatal: the process prints the
//! problem to stderr and exits non-zero before any transport is built.

use clap::Parser;

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum AuthMethodArg {
    Password,
    Key,
    Agent,
}

/// Command-line and environment configuration for the controller.
#[derive(Debug, Parser)]
#[command(name = "agentremote", about = "MCP server driving a remote host over SSH")]
pub struct Config {
    /// Operate on the local machine instead of over SSH. Intended for
    /// development and for the in-container-exec deployment shape;
    /// mutually exclusive with every `--ssh-*` flag.
    #[arg(long, env = "AGENTREMOTE_LOCAL")]
    pub local: bool,

    /// Remote hostname or address. Required unless `--local`.
    #[arg(long, env = "AGENTREMOTE_SSH_HOST")]
    pub ssh_host: Option<String>,

    /// Remote SSH port.
    #[arg(long, env = "AGENTREMOTE_SSH_PORT", default_value_t = 22)]
    pub ssh_port: u16,

    /// Remote username. Required unless `--local`.
    #[arg(long, env = "AGENTREMOTE_SSH_USER")]
    pub ssh_user: Option<String>,

    /// Which credential source to authenticate with.
    #[arg(long, value_enum, env = "AGENTREMOTE_AUTH_METHOD")]
    pub auth_method: Option<AuthMethodArg>,

    /// Password, when `--auth-method password`. Prefer the environment
    /// variable over the flag so the secret doesn't show up in `ps`.
    #[arg(long, env = "AGENTREMOTE_SSH_PASSWORD")]
    pub ssh_password: Option<String>,

    /// Private key path, when `--auth-method key`.
    #[arg(long, env = "AGENTREMOTE_SSH_KEY_PATH")]
    pub ssh_key_path: Option<String>,

    /// Passphrase for an encrypted private key, when `--auth-method key`.
    /// Prefer the environment variable over the flag so the secret doesn't
    /// show up in `ps`.
    #[arg(long, env = "AGENTREMOTE_SSH_KEY_PASSPHRASE")]
    pub ssh_key_passphrase: Option<String>,

    /// `SSH_AUTH_SOCK` path, when `--auth-method agent`.
    #[arg(long, env = "AGENTREMOTE_SSH_AGENT_SOCK")]
    pub ssh_agent_sock: Option<String>,
}

impl Config {
    /// Parse `argv`/environment and validate, exiting the process with a
    /// diagnostic on stderr if the combination is unusable.
    #[must_use]
    pub fn parse_and_validate() -> Self {
        let config = Self::parse();
        if let Err(msg) = config.validate() {
            eprintln!("agentremote: invalid configuration: {msg}");
            std::process::exit(2);
        }
        config
    }

    fn validate(&self) -> Result<(), String> {
        if self.local {
            if self.ssh_host.is_some() || self.ssh_user.is_some() || self.auth_method.is_some() {
                return Err("--local cannot be combined with any --ssh-* flag".to_string());
            }
            return Ok(());
        }

        let host = self
            .ssh_host
            .as_ref()
            .ok_or("--ssh-host (or AGENTREMOTE_SSH_HOST) is required unless --local is set")?;
        if host.is_empty() {
            return Err("--ssh-host must not be empty".to_string());
        }
        self.ssh_user
            .as_ref()
            .ok_or("--ssh-user (or AGENTREMOTE_SSH_USER) is required unless --local is set")?;

        match self.auth_method {
            Some(AuthMethodArg::Password) if self.ssh_password.is_none() => {
                Err("--auth-method password requires --ssh-password".to_string())
            }
            Some(AuthMethodArg::Key) if self.ssh_key_path.is_none() => {
                Err("--auth-method key requires --ssh-key-path".to_string())
            }
            Some(AuthMethodArg::Agent) if self.ssh_agent_sock.is_none() => {
                Err("--auth-method agent requires --ssh-agent-sock".to_string())
            }
            None => Err("--auth-method is required unless --local is set".to_string()),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(extra: &[&str]) -> Vec<String> {
        let mut args = vec!["agentremote".to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    }

    #[test]
    fn local_mode_needs_no_ssh_flags() {
        let cfg = Config::parse_from(base_args(&["--local"]));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn local_combined_with_ssh_host_is_rejected() {
        let cfg = Config::parse_from(base_args(&["--local", "--ssh-host", "example.com"]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ssh_mode_without_auth_method_is_rejected() {
        let cfg = Config::parse_from(base_args(&[
            "--ssh-host",
            "example.com",
            "--ssh-user",
            "root",
        ]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ssh_mode_with_key_auth_is_accepted() {
        let cfg = Config::parse_from(base_args(&[
            "--ssh-host",
            "example.com",
            "--ssh-user",
            "root",
            "--auth-method",
            "key",
            "--ssh-key-path",
            "/home/root/.ssh/id_ed25519",
        ]));
        assert!(cfg.validate().is_ok());
    }
}
