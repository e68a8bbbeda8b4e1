//! SSH command execution
//!
//! A session runs one wrapped [`Script`] per channel on a pseudo-terminal.
//! Channel output is turned into a stream of [`SessionEvent`]s by a
//! line-oriented [`PromptScanner`]; a detected sudo prompt is answered with
//! the session password and never reaches the collected output.

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect, Pty};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{RemoteError, Result};
use crate::script::{is_sudo_prompt, Script, SUDO_PROMPT_PREFIX};

/// sudo gives up after three attempts; so do we
const MAX_PROMPT_ANSWERS: usize = 3;

const TERMINAL_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 0),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Connection profile for one host
#[derive(Clone)]
pub struct SshOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Run commands through sudo unless `user` is root
    pub need_sudo: bool,
    pub connect_timeout: Duration,
}

impl fmt::Debug for SshOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"******")
            .field("need_sudo", &self.need_sudo)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Something that happened on a running command's channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Output text, one complete line or a trailing fragment
    Output(String),
    /// The remote side is waiting for the sudo password
    PromptDetected,
    /// The command finished
    Exit(u32),
}

/// Splits raw channel bytes into output lines and prompt events
#[derive(Debug, Default)]
pub struct PromptScanner {
    pending: Vec<u8>,
}

impl PromptScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of channel data
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SessionEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            // A prompt followed by a newline was already answered or abandoned
            if text.trim_start().starts_with(SUDO_PROMPT_PREFIX) {
                continue;
            }
            events.push(SessionEvent::Output(text.into_owned()));
        }

        if !self.pending.is_empty() && is_sudo_prompt(&String::from_utf8_lossy(&self.pending)) {
            self.pending.clear();
            events.push(SessionEvent::PromptDetected);
        }

        events
    }

    /// Flush whatever is left once the channel closes
    pub fn finish(&mut self) -> Option<SessionEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        if rest.trim_start().starts_with(SUDO_PROMPT_PREFIX) {
            None
        } else {
            Some(SessionEvent::Output(rest))
        }
    }
}

/// Host key policy: every key is accepted
struct AcceptHostKey;

#[async_trait]
impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated SSH connection to one host
pub struct SshSession {
    handle: Handle<AcceptHostKey>,
    options: SshOptions,
}

impl SshSession {
    /// Connect and authenticate with the profile's password
    #[instrument(skip(options), fields(host = %options.host, port = options.port))]
    pub async fn connect(options: &SshOptions) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let addr = (options.host.as_str(), options.port);

        let mut handle = timeout(
            options.connect_timeout,
            client::connect(config, addr, AcceptHostKey),
        )
        .await
        .map_err(|_| RemoteError::Timeout(options.host.clone()))??;

        let accepted = handle
            .authenticate_password(options.user.clone(), options.password.clone())
            .await?;
        if !accepted {
            return Err(RemoteError::AuthenticationFailed {
                user: options.user.clone(),
                host: options.host.clone(),
            });
        }

        debug!("SSH session established");
        Ok(Self {
            handle,
            options: options.clone(),
        })
    }

    /// Wrap and run `cmd`, returning its isolated output
    pub async fn run(&self, cmd: &str) -> Result<String> {
        let script = Script::wrap(&self.options.user, cmd, self.options.need_sudo);
        self.exec(&script).await
    }

    /// Run a prepared script on a fresh channel
    #[instrument(skip(self, script), fields(host = %self.options.host))]
    pub async fn exec(&self, script: &Script) -> Result<String> {
        debug!(shell = script.text(), "Running remote command");

        let mut channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(false, "xterm", 80, 40, 0, 0, TERMINAL_MODES)
            .await?;
        channel.exec(true, script.text()).await?;

        let mut scanner = PromptScanner::new();
        let mut collected = String::new();
        let mut exit_status = None;
        let mut answered = 0;

        while let Some(msg) = channel.wait().await {
            let events = match msg {
                ChannelMsg::Data { ref data } => scanner.feed(data),
                ChannelMsg::ExtendedData { ref data, .. } => scanner.feed(data),
                ChannelMsg::ExitStatus { exit_status } => vec![SessionEvent::Exit(exit_status)],
                ChannelMsg::Close => break,
                _ => Vec::new(),
            };

            for event in events {
                match event {
                    SessionEvent::Output(text) => collected.push_str(&text),
                    SessionEvent::PromptDetected => {
                        if answered >= MAX_PROMPT_ANSWERS {
                            warn!("sudo rejected the password");
                            return Err(RemoteError::SudoRejected(self.options.host.clone()));
                        }
                        answered += 1;
                        let reply = format!("{}\n", self.options.password);
                        channel.data(reply.as_bytes()).await?;
                    }
                    SessionEvent::Exit(status) => exit_status = Some(status),
                }
            }
        }

        if let Some(SessionEvent::Output(rest)) = scanner.finish() {
            collected.push_str(&rest);
        }

        let output = script.isolate_output(&collected, &self.options.password);
        debug!(output = %output, status = ?exit_status, "Remote command finished");

        match exit_status {
            Some(0) => Ok(output),
            Some(status) => Err(RemoteError::CommandFailed { status, output }),
            None => Err(RemoteError::NoExitStatus),
        }
    }

    /// Close the connection
    pub async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

/// Connect, run one command and disconnect
pub async fn remote_execute(options: &SshOptions, cmd: &str) -> Result<String> {
    let session = SshSession::connect(options).await?;
    let result = session.run(cmd).await;
    session.close().await;
    result
}
