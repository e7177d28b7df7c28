//! Wire channel to the remote debug server
//!
//! Owns a single TCP connection, performs the version exchange before any
//! other traffic, and serializes request/reply round trips through one gate.
//! A failed send tears the connection down and is retried according to the
//! reconnect policy.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, CodecError};
use crate::types::*;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Unable to establish connection to the debug server at host {endpoint}")]
    ConnectionFailed { endpoint: String },
    #[error("The debug server on host {endpoint} is out of date and missing critical features (server version {version}). Please update it to the latest available version.")]
    UnsupportedServerVersion { endpoint: String, version: String },
    #[error("The debug server on host {endpoint} does not support this client version. Please update the client.")]
    UnsupportedExtensionVersion { endpoint: String },
    #[error("Connection to the debug server at host {endpoint} was lost: {message}")]
    ConnectionLost { endpoint: String, message: String },
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Expected {expected} from the debug server, received {received}")]
    UnexpectedResponse { expected: &'static str, received: &'static str },
    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),
}

impl ChannelError {
    /// Errors meant to be shown to the user as-is, carrying the endpoint and cause
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ChannelError::ConnectionFailed { .. }
                | ChannelError::UnsupportedServerVersion { .. }
                | ChannelError::UnsupportedExtensionVersion { .. }
                | ChannelError::ConnectionLost { .. }
        )
    }

    fn is_version_mismatch(&self) -> bool {
        matches!(
            self,
            ChannelError::UnsupportedServerVersion { .. } | ChannelError::UnsupportedExtensionVersion { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Remote endpoint of the debug server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConnectionOptions {
    pub host: String,
    pub port: u16,
}

impl ServerConnectionOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for ServerConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How many times a failed send is retried on a fresh connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every following one
    pub backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 1, backoff_ms: 0 }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (starting at 1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Negotiated peer information, known after a successful version exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: Version,
    pub platform: Platform,
}

/// Receives human-readable traffic and connection messages
pub trait OutputSink: Send + Sync {
    fn print_message(&self, title: &str, body: &str);
}

/// Forwards channel messages to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn print_message(&self, title: &str, body: &str) {
        if body.is_empty() {
            log::info!("{}", title);
        } else {
            log::info!("{}\n{}", title, body);
        }
    }
}

/// Request/reply transport to the debug server.
///
/// Implementors provide the raw round trip; the typed helpers are derived
/// from it.
#[async_trait]
pub trait Channel: Send + Sync {
    fn connection_options(&self) -> ServerConnectionOptions;

    fn connection_state(&self) -> ClientState;

    async fn send_with_reply(&self, command: Command, cancel: &CancellationToken) -> Result<Response>;

    /// Drops the connection; the next send reconnects.
    fn force_disconnect(&self);

    async fn get_remote_environment(&self, cancel: &CancellationToken) -> Result<BTreeMap<String, String>> {
        self.list_environment_variables(cancel).await
    }

    async fn execute(&self, command: Execute, cancel: &CancellationToken) -> Result<ExecutionCompleted> {
        expect_response(self.send_with_reply(Command::Execute(command), cancel).await?)
    }

    async fn fetch_metadata(&self, command: FetchMetadata, cancel: &CancellationToken) -> Result<MetadataFetched> {
        expect_response(self.send_with_reply(Command::FetchMetadata(command), cancel).await?)
    }

    async fn fetch_result_range(
        &self,
        command: FetchResultRange,
        cancel: &CancellationToken,
    ) -> Result<ResultRangeFetched> {
        expect_response(self.send_with_reply(Command::FetchResultRange(command), cancel).await?)
    }

    async fn put_file(&self, command: PutFile, cancel: &CancellationToken) -> Result<PutFileResponse> {
        expect_response(self.send_with_reply(Command::PutFile(command), cancel).await?)
    }

    async fn deploy(&self, command: Deploy, cancel: &CancellationToken) -> Result<DeployResponse> {
        expect_response(self.send_with_reply(Command::Deploy(command), cancel).await?)
    }

    async fn list_environment_variables(&self, cancel: &CancellationToken) -> Result<BTreeMap<String, String>> {
        let listed: EnvironmentVariablesListed =
            expect_response(self.send_with_reply(Command::ListEnvironmentVariables, cancel).await?)?;
        Ok(listed.variables)
    }
}

fn expect_response<T: FromResponse>(response: Response) -> Result<T> {
    T::from_response(response).map_err(|other| ChannelError::UnexpectedResponse {
        expected: T::KIND,
        received: other.kind(),
    })
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ChannelError::Cancelled),
        res = fut => res,
    }
}

/// TCP implementation of [`Channel`]
pub struct CommunicationChannel {
    options: ServerConnectionOptions,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    sink: Arc<dyn OutputSink>,
    state: Mutex<ClientState>,
    server_info: Mutex<Option<ServerInfo>>,
    remote_environment: Mutex<Option<BTreeMap<String, String>>>,
    /// Cancelled by `force_disconnect` so an in-flight exchange stops waiting
    link: Mutex<CancellationToken>,
    /// Send gate; holds the open stream between requests
    connection: tokio::sync::Mutex<Option<TcpStream>>,
}

impl CommunicationChannel {
    pub fn new(options: ServerConnectionOptions) -> Self {
        Self {
            options,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            sink: Arc::new(LogSink),
            state: Mutex::new(ClientState::Disconnected),
            server_info: Mutex::new(None),
            remote_environment: Mutex::new(None),
            link: Mutex::new(CancellationToken::new()),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_output_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Negotiated server version and platform, connecting first if needed
    pub async fn server_info(&self, cancel: &CancellationToken) -> Result<ServerInfo> {
        let mut connection = self.connection.lock().await;
        self.ensure_connected(&mut connection, cancel).await?;
        self.cached_server_info()
            .ok_or_else(|| ChannelError::ConnectionFailed { endpoint: self.options.to_string() })
    }

    fn cached_server_info(&self) -> Option<ServerInfo> {
        *lock(&self.server_info)
    }

    fn set_state(&self, state: ClientState) {
        let mut current = lock(&self.state);
        if *current != state {
            log::debug!("Connection to {}: {:?} -> {:?}", self.options, *current, state);
            *current = state;
        }
    }

    fn link_token(&self) -> CancellationToken {
        lock(&self.link).clone()
    }

    /// Drops the stream held under the gate and resets cached peer state.
    fn reset(&self, connection: &mut Option<TcpStream>) {
        *connection = None;
        lock(&self.link).cancel();
        *lock(&self.remote_environment) = None;
        self.set_state(ClientState::Disconnected);
    }

    async fn ensure_connected(
        &self,
        connection: &mut Option<TcpStream>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if connection.is_some() && !self.link_token().is_cancelled() {
            return Ok(());
        }
        *connection = None;
        self.set_state(ClientState::Connecting);

        match self.establish(cancel).await {
            Ok((stream, info)) => {
                *lock(&self.server_info) = Some(info);
                *lock(&self.link) = CancellationToken::new();
                *connection = Some(stream);
                self.set_state(ClientState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ClientState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self, cancel: &CancellationToken) -> Result<(TcpStream, ServerInfo)> {
        let endpoint = self.options.to_string();
        let connect = async {
            let mut stream = TcpStream::connect((self.options.host.as_str(), self.options.port))
                .await
                .map_err(CodecError::Io)?;
            let info = self.exchange_versions(&mut stream).await?;
            Ok::<_, ChannelError>((stream, info))
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(self.connect_timeout, connect) => res.ok(),
        };

        match outcome {
            Some(Ok(established)) => Ok(established),
            Some(Err(e)) if e.is_version_mismatch() => Err(e),
            Some(Err(e)) => {
                log::debug!("Connecting to {} failed: {}", endpoint, e);
                Err(ChannelError::ConnectionFailed { endpoint })
            }
            None => {
                log::debug!("Connecting to {} timed out or was cancelled", endpoint);
                Err(ChannelError::ConnectionFailed { endpoint })
            }
        }
    }

    async fn exchange_versions(&self, stream: &mut TcpStream) -> Result<ServerInfo> {
        let endpoint = self.options.to_string();
        let command = Command::ExchangeVersions(ExchangeVersions {
            client_version: CLIENT_VERSION,
            client_platform: Platform::current(),
        });
        codec::write_command(stream, &command).await?;

        let response = match codec::read_response(stream).await {
            Ok((response, _)) => response,
            // Servers predating the version exchange close the connection on unknown commands
            Err(CodecError::EndOfStream) => {
                return Err(ChannelError::UnsupportedServerVersion {
                    endpoint,
                    version: "unknown".into(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let reply: ExchangeVersionsResponse = expect_response(response)?;
        log::debug!(
            "Version exchange with {}: {} (server {} on {})",
            endpoint,
            reply.status,
            reply.server_version,
            reply.server_platform
        );

        match reply.status {
            ExchangeVersionsStatus::ClientNotSupported => {
                return Err(ChannelError::UnsupportedExtensionVersion { endpoint })
            }
            ExchangeVersionsStatus::ServerNotSupported => {
                return Err(ChannelError::UnsupportedServerVersion {
                    endpoint,
                    version: reply.server_version.to_string(),
                })
            }
            ExchangeVersionsStatus::Successful => {}
        }
        if reply.server_version < MINIMUM_SERVER_VERSION {
            return Err(ChannelError::UnsupportedServerVersion {
                endpoint,
                version: reply.server_version.to_string(),
            });
        }
        if reply.server_version < CLIENT_VERSION {
            log::warn!(
                "The debug server on host {} is out of date. Some features may not work properly.",
                endpoint
            );
        }

        Ok(ServerInfo {
            version: reply.server_version,
            platform: reply.server_platform,
        })
    }

    async fn send_once(
        &self,
        connection: &mut Option<TcpStream>,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.ensure_connected(connection, cancel).await?;
        let link = self.link_token();
        let stream = connection.as_mut().ok_or(ChannelError::Cancelled)?;
        let endpoint = &self.options;

        let exchange = async {
            let sent = codec::write_command(stream, command).await?;
            log::debug!("SEND[{}]: {} ({} bytes)", endpoint, command.kind(), sent);
            self.sink
                .print_message(&format!("Sent command ({} bytes) to {}", sent, endpoint), &command.to_string());

            let (response, received) = codec::read_response(stream).await?;
            log::debug!("RECV[{}]: {} ({} bytes)", endpoint, response.kind(), received);
            self.sink.print_message(
                &format!("Received response ({} bytes) from {}", received, endpoint),
                &response.to_string(),
            );
            Ok(response)
        };

        tokio::select! {
            _ = link.cancelled() => Err(ChannelError::Cancelled),
            res = cancellable(cancel, exchange) => res,
        }
    }
}

#[async_trait]
impl Channel for CommunicationChannel {
    fn connection_options(&self) -> ServerConnectionOptions {
        self.options.clone()
    }

    fn connection_state(&self) -> ClientState {
        *lock(&self.state)
    }

    async fn send_with_reply(&self, command: Command, cancel: &CancellationToken) -> Result<Response> {
        let mut connection = self.connection.lock().await;
        let endpoint = self.options.to_string();
        let mut retries = 0u32;

        loop {
            let err = match self.send_once(&mut connection, &command, cancel).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            // The stream may be mid-message at this point, so it is never reused
            self.reset(&mut connection);

            if err.is_version_mismatch() {
                return Err(err);
            }
            if cancel.is_cancelled() {
                return match err {
                    ChannelError::ConnectionFailed { .. } => Err(err),
                    _ => Err(ChannelError::Cancelled),
                };
            }
            if matches!(err, ChannelError::Cancelled) {
                return Err(err);
            }

            if retries < self.reconnect.max_retries {
                retries += 1;
                log::warn!("SEND[{}]: {} failed: {}", endpoint, command.kind(), err);
                self.sink
                    .print_message(&format!("Connection to {} lost, attempting to reconnect...", endpoint), "");
                let delay = self.reconnect.delay_for(retries);
                if !delay.is_zero() {
                    cancellable(cancel, async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                continue;
            }

            log::error!("Could not reconnect to {}: {}", endpoint, err);
            self.sink.print_message(&format!("Could not reconnect to {}", endpoint), "");
            return Err(match err {
                ChannelError::ConnectionFailed { .. } => err,
                other => ChannelError::ConnectionLost {
                    endpoint,
                    message: other.to_string(),
                },
            });
        }
    }

    fn force_disconnect(&self) {
        lock(&self.link).cancel();
        *lock(&self.remote_environment) = None;
        if let Ok(mut connection) = self.connection.try_lock() {
            *connection = None;
        }
        self.set_state(ClientState::Disconnected);
    }

    async fn get_remote_environment(&self, cancel: &CancellationToken) -> Result<BTreeMap<String, String>> {
        if let Some(cached) = lock(&self.remote_environment).clone() {
            return Ok(cached);
        }
        let variables = self.list_environment_variables(cancel).await?;
        *lock(&self.remote_environment) = Some(variables.clone());
        Ok(variables)
    }
}

/// Poisoning only happens if a holder panicked; the guarded values stay valid.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
