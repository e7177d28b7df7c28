//! Profile configuration
//!
//! A profile is a TOML file describing the debug server connection, the
//! environment actions run in, and the actions themselves.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::actions::{ActionStep, RunActionStep};
use crate::communication::{ReconnectPolicy, ServerConnectionOptions};
use crate::runner::ActionEnvironment;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read profile {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid profile: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Action {0} is not defined in the profile")]
    UnknownAction(String),
    #[error("Action {0} is defined more than once")]
    DuplicateAction(String),
    #[error("Action {0} runs itself: {1}")]
    RecursiveAction(String, String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9339
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { max_retries: default_max_retries(), backoff_ms: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub local_workdir: String,
    #[serde(default)]
    pub remote_workdir: String,
    #[serde(default)]
    pub watches: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<ActionStep>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

impl Profile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading profile from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses a profile and checks that every action reference resolves.
    pub fn parse(text: &str) -> Result<Self> {
        let profile: Profile = toml::from_str(text)?;
        for (i, action) in profile.actions.iter().enumerate() {
            if profile.actions[..i].iter().any(|a| a.name == action.name) {
                return Err(ConfigError::DuplicateAction(action.name.clone()));
            }
        }
        for action in &profile.actions {
            profile.action_steps(&action.name)?;
        }
        Ok(profile)
    }

    pub fn connection_options(&self) -> ServerConnectionOptions {
        ServerConnectionOptions::new(self.connection.host.clone(), self.connection.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.connection.reconnect.max_retries,
            backoff_ms: self.connection.reconnect.backoff_ms,
        }
    }

    pub fn environment(&self) -> ActionEnvironment {
        ActionEnvironment {
            local_workdir: self.environment.local_workdir.clone(),
            remote_workdir: self.environment.remote_workdir.clone(),
            watches: self.environment.watches.clone(),
        }
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|a| a.name.as_str())
    }

    /// Steps of `name` with every nested `run_action` expanded.
    pub fn action_steps(&self, name: &str) -> Result<Vec<ActionStep>> {
        let mut stack = vec![name.to_string()];
        let action = self.find(name)?;
        self.resolve(&action.steps, &mut stack)
    }

    fn find(&self, name: &str) -> Result<&ActionConfig> {
        self.actions
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| ConfigError::UnknownAction(name.to_string()))
    }

    fn resolve(&self, steps: &[ActionStep], stack: &mut Vec<String>) -> Result<Vec<ActionStep>> {
        steps
            .iter()
            .map(|step| match step {
                ActionStep::RunAction(run) => {
                    if stack.contains(&run.name) {
                        let chain = format!("{} -> {}", stack.join(" -> "), run.name);
                        return Err(ConfigError::RecursiveAction(stack[0].clone(), chain));
                    }
                    let source = match self.find(&run.name) {
                        Ok(action) => &action.steps,
                        // Inline steps stand in for an action missing from the profile
                        Err(_) if !run.steps.is_empty() => &run.steps,
                        Err(e) => return Err(e),
                    };
                    stack.push(run.name.clone());
                    let resolved = self.resolve(source, stack);
                    stack.pop();
                    Ok(ActionStep::RunAction(RunActionStep { name: run.name.clone(), steps: resolved? }))
                }
                other => Ok(other.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
[connection]
host = "10.0.0.5"
port = 9339

[connection.reconnect]
max_retries = 3
backoff_ms = 250

[environment]
remote_workdir = "/tmp/work"
watches = ["a", "tid"]

[[actions]]
name = "Build"
[[actions.steps]]
type = "execute"
executable = "make"
timeout_secs = 60

[[actions]]
name = "Debug"
[[actions.steps]]
type = "run_action"
name = "Build"
[[actions.steps]]
type = "read_debug_data"
binary_output = true
output_file = { path = "/tmp/work/out.bin" }
dispatch_params_file = { path = "/tmp/work/status.txt", check_timestamp = false }
"#;

    #[test]
    fn test_load_profile() {
        let profile = Profile::parse(PROFILE).unwrap();
        assert_eq!(profile.connection_options().to_string(), "10.0.0.5:9339");
        assert_eq!(profile.connect_timeout(), Duration::from_secs(5));
        assert_eq!(profile.reconnect_policy(), ReconnectPolicy { max_retries: 3, backoff_ms: 250 });
        assert_eq!(profile.environment().watches, vec!["a", "tid"]);
        assert_eq!(profile.action_names().collect::<Vec<_>>(), vec!["Build", "Debug"]);
    }

    #[test]
    fn test_nested_action_is_expanded() {
        let profile = Profile::parse(PROFILE).unwrap();
        let steps = profile.action_steps("Debug").unwrap();
        assert_eq!(ActionStep::total_step_count(&steps), 3);
        match &steps[0] {
            ActionStep::RunAction(run) => {
                assert_eq!(run.name, "Build");
                assert!(matches!(run.steps[0], ActionStep::Execute(_)));
            }
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let profile = Profile::parse("").unwrap();
        assert_eq!(profile.connection_options().to_string(), "127.0.0.1:9339");
        assert_eq!(profile.reconnect_policy(), ReconnectPolicy::default());
        assert!(matches!(profile.action_steps("Debug"), Err(ConfigError::UnknownAction(_))));
    }

    #[test]
    fn test_recursive_action_is_rejected() {
        let text = r#"
[[actions]]
name = "A"
[[actions.steps]]
type = "run_action"
name = "B"

[[actions]]
name = "B"
[[actions.steps]]
type = "run_action"
name = "A"
"#;
        match Profile::parse(text) {
            Err(ConfigError::RecursiveAction(name, chain)) => {
                assert_eq!(name, "A");
                assert_eq!(chain, "A -> B -> A");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_step_type() {
        let text = r#"
[[actions]]
name = "A"
[[actions.steps]]
type = "teleport"
"#;
        assert!(matches!(Profile::parse(text), Err(ConfigError::Toml(_))));
    }
}
