//! Remote debug adapter
//!
//! Talks to a remote debug server over TCP, runs build/debug actions against
//! it and decodes the dispatch output those actions produce into per-lane
//! watch values.

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod actions;
pub mod break_state;
pub mod codec;
pub mod communication;
pub mod config;
pub mod parser;
pub mod process;
pub mod runner;
pub mod types;

pub use actions::*;
pub use break_state::{
    BreakState, BreakStateData, BreakStateOutputFile, SliceWatchView, WatchView, SYSTEM_WATCH, WAVE_SIZE,
};
pub use codec::CodecError;
pub use communication::{
    Channel, ChannelError, CommunicationChannel, LogSink, OutputSink, ReconnectPolicy, ServerConnectionOptions,
    ServerInfo,
};
pub use config::{ConfigError, Profile};
pub use parser::{BreakStateDispatchParameters, DispatchParamsError, DispatchParamsRule};
pub use runner::{ActionEnvironment, ActionRunner, ActionRunnerCallbacks, NoopCallbacks};
pub use types::*;

#[derive(Error, Debug)]
pub enum RadError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DispatchParams(#[from] DispatchParamsError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("No break state is available. Run an action that reads debug data first.")]
    NoBreakState,
}

pub type Result<T> = std::result::Result<T, RadError>;

/// Builds the TCP channel described by a profile
pub fn open_channel(profile: &Profile) -> CommunicationChannel {
    CommunicationChannel::new(profile.connection_options())
        .with_connect_timeout(profile.connect_timeout())
        .with_reconnect_policy(profile.reconnect_policy())
}

/// Owns the channel for a debugging session and the break state of the
/// most recent debug run.
pub struct DebugSession {
    channel: Arc<dyn Channel>,
    callbacks: Arc<dyn ActionRunnerCallbacks>,
    environment: ActionEnvironment,
    break_state: Option<BreakState>,
}

impl DebugSession {
    pub fn new(
        channel: Arc<dyn Channel>,
        callbacks: Arc<dyn ActionRunnerCallbacks>,
        environment: ActionEnvironment,
    ) -> Self {
        Self {
            channel,
            callbacks,
            environment,
            break_state: None,
        }
    }

    pub fn from_profile(profile: &Profile) -> Self {
        Self::new(
            Arc::new(open_channel(profile)),
            Arc::new(NoopCallbacks),
            profile.environment(),
        )
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn environment(&self) -> &ActionEnvironment {
        &self.environment
    }

    /// Runs an action. A break state produced by the run replaces the
    /// previous one.
    pub async fn run_action(
        &mut self,
        action_name: &str,
        steps: &[ActionStep],
        continue_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<ActionRunResult> {
        let mut runner = ActionRunner::new(self.channel.clone(), self.callbacks.clone(), self.environment.clone());
        let mut result = runner.run(action_name, steps, continue_on_error, cancel).await?;

        if let Some(break_state) = result.take_break_state() {
            log::info!(
                "Break state updated: {} dwords, {} watches",
                break_state.data.output_file().dword_count,
                break_state.data.watches().len()
            );
            self.break_state = Some(break_state);
        }
        Ok(result)
    }

    pub fn break_state(&self) -> Option<&BreakState> {
        self.break_state.as_ref()
    }

    /// Selects a group of the current break state, fetching it if needed.
    ///
    /// # Panics
    ///
    /// Panics if `group_size` is not a non-zero multiple of [`WAVE_SIZE`].
    pub async fn change_group(
        &mut self,
        group_index: usize,
        group_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let break_state = self.break_state.as_mut().ok_or(RadError::NoBreakState)?;
        let warning = break_state
            .data
            .change_group_with_warnings(self.channel.as_ref(), group_index, group_size, cancel)
            .await?;
        if let Some(w) = &warning {
            log::warn!("Group #{}: {}", group_index, w);
        }
        Ok(warning)
    }

    /// Drops the break state and the connection
    pub fn close(&mut self) {
        self.break_state = None;
        self.channel.force_disconnect();
    }
}
