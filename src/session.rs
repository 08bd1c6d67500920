use crate::{CirrusError, Result, log_debug, log_info};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

/// One blocking shell round trip at a time against a single host. Every
/// caller in the workflow treats a non-zero exit as fatal; use
/// `run_checked` unless partial failure is genuinely tolerable.
#[async_trait]
pub trait RemoteSession: Send {
    fn host(&self) -> &str;

    /// Run a command, feeding stdout chunks to `progress` as they arrive.
    async fn run_with_progress(
        &mut self,
        command: &str,
        progress: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<CommandOutput>;

    async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        self.run_with_progress(command, &mut |_| {}).await
    }

    async fn close(&mut self) -> Result<()>;
}

/// Run a command and fail on any non-zero exit.
pub async fn run_checked(session: &mut dyn RemoteSession, command: &str) -> Result<CommandOutput> {
    let output = session.run(command).await?;
    check_exit(session.host(), command, output)
}

pub async fn run_checked_with_progress(
    session: &mut dyn RemoteSession,
    command: &str,
    progress: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> Result<CommandOutput> {
    let output = session.run_with_progress(command, progress).await?;
    check_exit(session.host(), command, output)
}

fn check_exit(host: &str, command: &str, output: CommandOutput) -> Result<CommandOutput> {
    if output.exit_code != 0 {
        log_debug!("command failed on {}: {}", host, command);
        return Err(CirrusError::RemoteCommandFailed {
            host: host.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Supplies authentication material for a session: a private key first,
/// a password if key auth is rejected. Injectable so tests never touch
/// the console.
pub trait CredentialProvider: Send + Sync {
    fn key_path(&self) -> Option<PathBuf>;
    fn password_for(&self, host: &str) -> Result<String>;
}

/// Production credentials: configured key, interactive password fallback.
pub struct PromptCredentials {
    key_path: Option<PathBuf>,
}

impl PromptCredentials {
    pub fn new(key_path: Option<PathBuf>) -> Self {
        Self { key_path }
    }
}

impl CredentialProvider for PromptCredentials {
    fn key_path(&self) -> Option<PathBuf> {
        self.key_path
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".ssh").join("id_rsa")))
    }

    fn password_for(&self, host: &str) -> Result<String> {
        eprint!("Please enter password for {}: ", host);
        io::stderr().flush()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        Ok(line.trim_end().to_string())
    }
}

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Compute hosts come and go; host-key pinning is handled out of band.
        Ok(true)
    }
}

/// A channel that closes without delivering an exit status (dropped
/// connection, remote sshd gone) or whose command died on a signal must
/// never look like a clean exit; the workflow treats every command result
/// as authoritative before moving to the next stage.
fn finalize_output(
    host: &str,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    status: Option<u32>,
    killed_by: Option<String>,
) -> Result<CommandOutput> {
    let stderr_text = String::from_utf8_lossy(&stderr).into_owned();
    if let Some(signal) = killed_by {
        return Err(CirrusError::RemoteCommandFailed {
            host: host.to_string(),
            exit_code: 128,
            stderr: format!("terminated by signal {}: {}", signal, stderr_text.trim()),
        });
    }
    let exit_code = status.ok_or_else(|| CirrusError::RemoteCommandFailed {
        host: host.to_string(),
        exit_code: 255,
        stderr: "channel closed without an exit status".to_string(),
    })?;
    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: stderr_text,
    })
}

fn ssh_err(host: &str, err: russh::Error) -> CirrusError {
    CirrusError::SshError {
        host: host.to_string(),
        message: err.to_string(),
    }
}

/// SSH-backed session to a compute host or guest.
pub struct SshSession {
    host: String,
    handle: Handle<ClientHandler>,
}

impl SshSession {
    pub async fn connect(
        host: &str,
        user: &str,
        credentials: &dyn CredentialProvider,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            connect_timeout,
            client::connect(config, (host, 22), ClientHandler),
        )
        .await
        .map_err(|_| CirrusError::SshError {
            host: host.to_string(),
            message: format!("connect timed out after {:?}", connect_timeout),
        })?
        .map_err(|e| ssh_err(host, e))?;

        let mut authenticated = false;
        if let Some(path) = credentials.key_path() {
            match russh_keys::load_secret_key(&path, None) {
                Ok(key_pair) => {
                    authenticated = handle
                        .authenticate_publickey(user, Arc::new(key_pair))
                        .await
                        .map_err(|e| ssh_err(host, e))?;
                }
                Err(e) => {
                    log_debug!("cannot load key {}: {}", path.display(), e);
                }
            }
        }
        if !authenticated {
            log_info!("key auth unavailable for {}, falling back to password", host);
            let password = credentials.password_for(host)?;
            authenticated = handle
                .authenticate_password(user, &password)
                .await
                .map_err(|e| ssh_err(host, e))?;
        }
        if !authenticated {
            return Err(CirrusError::AuthFailed(host.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            handle,
        })
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run_with_progress(
        &mut self,
        command: &str,
        progress: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_err(&self.host, e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ssh_err(&self.host, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut status = None;
        let mut killed_by = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    progress(&String::from_utf8_lossy(data));
                    stdout.extend_from_slice(data);
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    stderr.extend_from_slice(data);
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    status = Some(exit_status);
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    killed_by = Some(format!("{:?}", signal_name));
                }
                _ => {}
            }
        }

        finalize_output(&self.host, stdout, stderr, status, killed_by)
    }

    async fn close(&mut self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| ssh_err(&self.host, e))?;
        Ok(())
    }
}

/// Opens sessions on demand; the orchestrator needs one per compute host
/// plus one to the migrated guest, created at different workflow stages.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>>;
}

pub struct SshSessionFactory {
    user: String,
    credentials: Arc<dyn CredentialProvider>,
    connect_timeout: Duration,
}

impl SshSessionFactory {
    pub fn new(
        user: String,
        credentials: Arc<dyn CredentialProvider>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            user,
            credentials,
            connect_timeout,
        }
    }
}

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>> {
        let session = SshSession::connect(
            host,
            &self.user,
            self.credentials.as_ref(),
            self.connect_timeout,
        )
        .await?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_exit_carries_streams_through() {
        let output = finalize_output(
            "192.168.10.1",
            b"archived".to_vec(),
            b"".to_vec(),
            Some(0),
            None,
        )
        .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "archived");
    }

    #[test]
    fn nonzero_exit_is_reported_not_errored() {
        // run_checked owns the non-zero policy; the session layer only
        // reports what the remote said.
        let output =
            finalize_output("192.168.10.1", Vec::new(), b"boom".to_vec(), Some(2), None).unwrap();
        assert_eq!(output.exit_code, 2);
        assert_eq!(output.stderr, "boom");
    }

    #[test]
    fn missing_exit_status_is_never_success() {
        let err = finalize_output("192.168.10.1", b"partial".to_vec(), Vec::new(), None, None)
            .unwrap_err();
        match err {
            CirrusError::RemoteCommandFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 255);
                assert!(stderr.contains("without an exit status"));
            }
            other => panic!("expected RemoteCommandFailed, got {:?}", other),
        }
    }

    #[test]
    fn signal_killed_command_is_never_success() {
        let err = finalize_output(
            "192.168.10.1",
            Vec::new(),
            b"Killed".to_vec(),
            None,
            Some("KILL".to_string()),
        )
        .unwrap_err();
        match err {
            CirrusError::RemoteCommandFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 128);
                assert!(stderr.contains("signal KILL"));
            }
            other => panic!("expected RemoteCommandFailed, got {:?}", other),
        }
    }
}
