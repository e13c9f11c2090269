//! SSH implementation of [`RemoteShell`] on top of `russh`
//!
//! Each command gets its own connection and session. The connection is owned
//! by the call that opened it and is disconnected on every exit path.

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::auth::{Credential, NodeAuth};
use crate::config::EngineConfig;
use crate::error::{K3sError, K3sResult};
use crate::retry::{retry_fixed, FixedBackoff};
use crate::transport::{tracing_line_handler, LineHandler, RemoteShell, StreamKind};

/// Client handler accepting any host key.
///
/// Target nodes are freshly provisioned machines whose host keys are not
/// known in advance.
struct AcceptingHandler {
    host: String,
}

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        trace!("Accepting host key presented by {}", self.host);
        Ok(true)
    }
}

enum Secret {
    Key(Arc<key::KeyPair>),
    Password(String),
}

/// Result of one executed command
struct Execution {
    exit_status: Option<u32>,
    output: String,
}

pub struct SshTransport {
    host: String,
    port: u16,
    user: String,
    secret: Secret,
    client_config: Arc<client::Config>,
    connect_timeout: Duration,
    backoff: FixedBackoff,
    line_handler: LineHandler,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish()
    }
}

impl SshTransport {
    /// Build a transport for one node. The private key is decoded here so a
    /// malformed key fails before anything touches the network.
    pub fn new(auth: &NodeAuth, config: &EngineConfig) -> K3sResult<Self> {
        let secret = match auth.credential()? {
            Credential::PrivateKey(pem) => {
                let pair = russh_keys::decode_secret_key(&pem, None).map_err(|e| {
                    K3sError::InvalidCredential {
                        message: format!("cannot decode private key for {}: {}", auth.host, e),
                    }
                })?;
                Secret::Key(Arc::new(pair))
            }
            Credential::Password(password) => Secret::Password(password),
        };

        let port = if auth.port == 0 { config.ssh.port } else { auth.port };

        Ok(Self {
            host: auth.host.clone(),
            port,
            user: auth.user.clone(),
            secret,
            client_config: Arc::new(client::Config::default()),
            connect_timeout: config.ssh.connect_timeout,
            backoff: FixedBackoff::new(
                config.ssh.reachability_attempts,
                config.ssh.reachability_backoff,
            ),
            line_handler: tracing_line_handler(),
        })
    }

    /// Replace the handler receiving streamed output lines.
    pub fn with_line_handler(mut self, handler: LineHandler) -> Self {
        self.line_handler = handler;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connection_error(&self, details: impl std::fmt::Display) -> K3sError {
        K3sError::Connection {
            address: self.address(),
            details: details.to_string(),
        }
    }

    /// Dial, handshake and authenticate.
    async fn connect(&self) -> K3sResult<Handle<AcceptingHandler>> {
        let handler = AcceptingHandler {
            host: self.host.clone(),
        };
        let dial = client::connect(
            self.client_config.clone(),
            (self.host.as_str(), self.port),
            handler,
        );
        let mut session = tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| {
                self.connection_error(format!("timed out after {:?}", self.connect_timeout))
            })?
            .map_err(|e| self.connection_error(e))?;

        let accepted = match &self.secret {
            Secret::Key(pair) => session
                .authenticate_publickey(self.user.as_str(), pair.clone())
                .await
                .map_err(|e| self.connection_error(e))?,
            Secret::Password(password) => session
                .authenticate_password(self.user.as_str(), password.as_str())
                .await
                .map_err(|e| self.connection_error(e))?,
        };

        if !accepted {
            close(session).await;
            return Err(K3sError::Authentication {
                address: self.address(),
                user: self.user.clone(),
            });
        }

        Ok(session)
    }

    /// Execute one command on a fresh connection, collecting combined output.
    async fn exec_combined(&self, command: &str) -> K3sResult<Execution> {
        let session = self.connect().await?;
        let result = collect_combined(&session, command).await;
        close(session).await;
        result.map_err(|e| K3sError::command(&self.host, command, e.to_string()))
    }

    /// Execute one command on a fresh connection, streaming its output.
    async fn exec_streamed(&self, command: &str) -> K3sResult<Option<u32>> {
        let session = self.connect().await?;
        let result = stream_lines(&session, command, &self.host, &self.line_handler).await;
        close(session).await;
        result.map_err(|e| K3sError::command(&self.host, command, e.to_string()))
    }
}

#[async_trait]
impl RemoteShell for SshTransport {
    fn host(&self) -> &str {
        &self.host
    }

    #[instrument(skip(self, command), fields(host = %self.host))]
    async fn run_combined(&self, command: &str) -> K3sResult<String> {
        debug!("Running '{}'", crate::error::redact_command(command));
        let execution = self.exec_combined(command).await?;
        match execution.exit_status {
            Some(0) => Ok(execution.output),
            status => Err(K3sError::command(
                &self.host,
                command,
                format!("{}: {}", describe_status(status), execution.output.trim()),
            )),
        }
    }

    #[instrument(skip(self, commands), fields(host = %self.host))]
    async fn run_streamed(&self, commands: &[String]) -> K3sResult<()> {
        for command in commands {
            debug!("Streaming '{}'", crate::error::redact_command(command));
            let status = self.exec_streamed(command).await?;
            if status != Some(0) {
                return Err(K3sError::command(&self.host, command, describe_status(status)));
            }
        }
        Ok(())
    }

    async fn wait_until_reachable(&self) -> K3sResult<()> {
        let policy = self.backoff;
        let result = retry_fixed(policy, "ssh readiness probe", |attempt| async move {
            trace!("Probing {} (attempt {})", self.address(), attempt);
            let session = self.connect().await?;
            close(session).await;
            Ok::<(), K3sError>(())
        })
        .await;

        match result {
            Ok(()) => {
                info!("Host {} is reachable", self.address());
                Ok(())
            }
            Err(e) => Err(K3sError::Unreachable {
                address: self.address(),
                attempts: policy.max_attempts,
                details: e.to_string(),
            }),
        }
    }
}

async fn close(session: Handle<AcceptingHandler>) {
    if let Err(e) = session
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        trace!("Ignoring disconnect error: {}", e);
    }
}

fn describe_status(status: Option<u32>) -> String {
    match status {
        Some(code) => format!("exited with status {}", code),
        None => "session closed without exit status".to_string(),
    }
}

async fn collect_combined(
    session: &Handle<AcceptingHandler>,
    command: &str,
) -> Result<Execution, russh::Error> {
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut output = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => output.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            _ => {}
        }
    }

    Ok(Execution {
        exit_status,
        output: String::from_utf8_lossy(&output).into_owned(),
    })
}

/// Pump channel messages into one queue per stream and drain both queues
/// concurrently. The command is complete once the pump and both readers are.
async fn stream_lines(
    session: &Handle<AcceptingHandler>,
    command: &str,
    host: &str,
    handler: &LineHandler,
) -> Result<Option<u32>, russh::Error> {
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, command).await?;

    let (stdout_tx, stdout_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (stderr_tx, stderr_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let pump = async move {
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    let _ = stdout_tx.send(data.to_vec());
                }
                ChannelMsg::ExtendedData { ref data, .. } => {
                    let _ = stderr_tx.send(data.to_vec());
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }
        // Dropping the senders here lets both readers finish.
        exit_status
    };

    let (exit_status, (), ()) = tokio::join!(
        pump,
        drain_lines(stdout_rx, host, StreamKind::Stdout, handler),
        drain_lines(stderr_rx, host, StreamKind::Stderr, handler),
    );

    if exit_status.is_none() {
        warn!("Command on {} ended without an exit status", host);
    }
    Ok(exit_status)
}

async fn drain_lines(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    host: &str,
    stream: StreamKind,
    handler: &LineHandler,
) {
    let mut splitter = LineSplitter::default();
    while let Some(chunk) = rx.recv().await {
        for line in splitter.push(&chunk) {
            handler(host, stream, &line);
        }
    }
    if let Some(rest) = splitter.finish() {
        handler(host, stream, &rest);
    }
}

/// Reassembles lines from arbitrarily split byte chunks.
#[derive(Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(decode_line(&self.pending))
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}
