//! Debug server protocol types
//!
//! This module defines the commands the client sends to the remote debug
//! server, the responses it receives back, and the small value types
//! (versions, platforms, timestamps) both sides negotiate with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version this client announces during the version exchange
pub const CLIENT_VERSION: Version = Version::new(2024, 3, 3);

/// Oldest server version the client agrees to talk to
pub const MINIMUM_SERVER_VERSION: Version = Version::new(2023, 10, 0);

/// File modification time, in milliseconds since the Unix epoch.
///
/// The default value (zero) stands for "unknown / file missing".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Timestamp(i64::try_from(since.as_millis()).unwrap_or(i64::MAX)),
            Err(before) => Timestamp(-i64::try_from(before.duration().as_millis()).unwrap_or(i64::MAX)),
        }
    }

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Semantic version exchanged during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Version { major, minor, patch }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    /// Accepts `major[.minor[.patch]]`; missing components are zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u32; 3];
        let mut count = 0;
        for component in s.trim().split('.') {
            let slot = parts
                .get_mut(count)
                .ok_or_else(|| format!("Too many version components in '{}'", s))?;
            *slot = component
                .parse()
                .map_err(|_| format!("Invalid version component '{}' in '{}'", component, s))?;
            count += 1;
        }
        Ok(Version::new(parts[0], parts[1], parts[2]))
    }
}

/// Operating system a peer runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Windows,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Windows => "Windows",
            Platform::Linux => "Linux",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "windows" => Ok(Platform::Windows),
            "linux" => Ok(Platform::Linux),
            other => Err(format!("Unknown platform: {}", other)),
        }
    }
}

/// Lifecycle of the connection to the debug server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Declares a byte-backed status enum with lossless conversions to and from the wire byte.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_byte(self) -> u8 {
                self as u8
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

wire_enum!(
    /// Outcome of a remote (or local) process execution
    ExecutionStatus {
        Completed = 0,
        TimedOut = 1,
        CouldNotLaunch = 2,
    }
);

wire_enum!(
    /// Outcome of a metadata or range fetch
    FetchStatus {
        Successful = 0,
        FileNotFound = 1,
    }
);

wire_enum!(
    /// Outcome of a file write on the server (PutFile, Deploy)
    WriteStatus {
        Successful = 0,
        PermissionDenied = 1,
        OtherIOError = 2,
    }
);

wire_enum!(
    /// Server verdict on the client version
    ExchangeVersionsStatus {
        Successful = 0,
        ServerNotSupported = 1,
        ClientNotSupported = 2,
    }
);

// Commands

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execute {
    pub working_directory: String,
    pub executable: String,
    pub arguments: String,
    pub environment_variables: BTreeMap<String, String>,
    pub run_as_administrator: bool,
    pub wait_for_completion: bool,
    /// Zero disables the timeout
    pub execution_timeout_secs: u32,
}

impl Default for Execute {
    fn default() -> Self {
        Self {
            working_directory: String::new(),
            executable: String::new(),
            arguments: String::new(),
            environment_variables: BTreeMap::new(),
            run_as_administrator: false,
            wait_for_completion: true,
            execution_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMetadata {
    pub file_path: String,
    pub binary_output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResultRange {
    pub file_path: String,
    pub binary_output: bool,
    pub byte_offset: u32,
    /// Zero requests everything from `byte_offset` to the end of the file
    pub byte_count: u32,
    /// Header size to skip before `byte_offset` is applied
    pub output_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutFile {
    pub path: String,
    pub working_dir: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deploy {
    pub data: Vec<u8>,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeVersions {
    pub client_version: Version,
    pub client_platform: Platform,
}

/// A request sent to the debug server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Execute(Execute),
    FetchMetadata(FetchMetadata),
    FetchResultRange(FetchResultRange),
    ListEnvironmentVariables,
    PutFile(PutFile),
    Deploy(Deploy),
    ExchangeVersions(ExchangeVersions),
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Execute(_) => "Execute",
            Command::FetchMetadata(_) => "FetchMetadata",
            Command::FetchResultRange(_) => "FetchResultRange",
            Command::ListEnvironmentVariables => "ListEnvironmentVariables",
            Command::PutFile(_) => "PutFile",
            Command::Deploy(_) => "Deploy",
            Command::ExchangeVersions(_) => "ExchangeVersions",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind())?;
        match self {
            Command::Execute(c) => {
                writeln!(f, "WorkingDirectory = {}", c.working_directory)?;
                writeln!(f, "Executable = {}", c.executable)?;
                writeln!(f, "Arguments = {}", c.arguments)?;
                let env: Vec<String> = c
                    .environment_variables
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, v))
                    .collect();
                writeln!(f, "EnvironmentVariables = {{ {} }}", env.join(", "))?;
                writeln!(f, "RunAsAdministrator = {}", c.run_as_administrator)?;
                writeln!(f, "WaitForCompletion = {}", c.wait_for_completion)?;
                write!(f, "ExecutionTimeoutSecs = {}", c.execution_timeout_secs)
            }
            Command::FetchMetadata(c) => {
                writeln!(f, "FilePath = {}", c.file_path)?;
                write!(f, "BinaryOutput = {}", c.binary_output)
            }
            Command::FetchResultRange(c) => {
                writeln!(f, "FilePath = {}", c.file_path)?;
                writeln!(f, "BinaryOutput = {}", c.binary_output)?;
                writeln!(f, "ByteOffset = {}", c.byte_offset)?;
                writeln!(f, "ByteCount = {}", c.byte_count)?;
                write!(f, "OutputOffset = {}", c.output_offset)
            }
            Command::ListEnvironmentVariables => Ok(()),
            Command::PutFile(c) => {
                writeln!(f, "Path = {}", c.path)?;
                writeln!(f, "WorkingDir = {}", c.working_dir)?;
                write!(f, "Data = <{} bytes>", c.data.len())
            }
            Command::Deploy(c) => {
                writeln!(f, "Destination = {}", c.destination)?;
                write!(f, "Data = <{} bytes>", c.data.len())
            }
            Command::ExchangeVersions(c) => {
                writeln!(f, "ClientVersion = {}", c.client_version)?;
                write!(f, "ClientPlatform = {}", c.client_platform)
            }
        }
    }
}

// Responses

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCompleted {
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFetched {
    pub status: FetchStatus,
    pub timestamp: Timestamp,
    pub byte_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRangeFetched {
    pub status: FetchStatus,
    pub timestamp: Timestamp,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariablesListed {
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutFileResponse {
    pub status: WriteStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResponse {
    pub status: WriteStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeVersionsResponse {
    pub status: ExchangeVersionsStatus,
    pub server_version: Version,
    pub server_platform: Platform,
}

/// A reply received from the debug server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ExecutionCompleted(ExecutionCompleted),
    MetadataFetched(MetadataFetched),
    ResultRangeFetched(ResultRangeFetched),
    EnvironmentVariablesListed(EnvironmentVariablesListed),
    PutFile(PutFileResponse),
    Deploy(DeployResponse),
    ExchangeVersions(ExchangeVersionsResponse),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::ExecutionCompleted(_) => "ExecutionCompleted",
            Response::MetadataFetched(_) => "MetadataFetched",
            Response::ResultRangeFetched(_) => "ResultRangeFetched",
            Response::EnvironmentVariablesListed(_) => "EnvironmentVariablesListed",
            Response::PutFile(_) => "PutFileResponse",
            Response::Deploy(_) => "DeployResponse",
            Response::ExchangeVersions(_) => "ExchangeVersionsResponse",
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind())?;
        match self {
            Response::ExecutionCompleted(r) => {
                writeln!(f, "Status = {}", r.status)?;
                writeln!(f, "ExitCode = {}", r.exit_code)?;
                writeln!(f, "Stdout = <{} chars>", r.stdout.chars().count())?;
                write!(f, "Stderr = <{} chars>", r.stderr.chars().count())
            }
            Response::MetadataFetched(r) => {
                writeln!(f, "ByteCount = {}", r.byte_count)?;
                writeln!(f, "Timestamp = {}", r.timestamp)?;
                write!(f, "Status = {}", r.status)
            }
            Response::ResultRangeFetched(r) => {
                writeln!(f, "Data = <{} bytes>", r.data.len())?;
                writeln!(f, "Timestamp = {}", r.timestamp)?;
                write!(f, "Status = {}", r.status)
            }
            Response::EnvironmentVariablesListed(r) => {
                write!(f, "Variables = <{} items>", r.variables.len())
            }
            Response::PutFile(r) => write!(f, "Status = {}", r.status),
            Response::Deploy(r) => write!(f, "Status = {}", r.status),
            Response::ExchangeVersions(r) => {
                writeln!(f, "Status = {}", r.status)?;
                writeln!(f, "ServerVersion = {}", r.server_version)?;
                write!(f, "ServerPlatform = {}", r.server_platform)
            }
        }
    }
}

/// Typed extraction of one response variant
pub trait FromResponse: Sized {
    const KIND: &'static str;

    /// Returns the original response back when it is of a different kind.
    fn from_response(response: Response) -> Result<Self, Response>;
}

macro_rules! from_response {
    ($ty:ty, $variant:ident, $kind:expr) => {
        impl FromResponse for $ty {
            const KIND: &'static str = $kind;

            fn from_response(response: Response) -> Result<Self, Response> {
                match response {
                    Response::$variant(inner) => Ok(inner),
                    other => Err(other),
                }
            }
        }
    };
}

from_response!(ExecutionCompleted, ExecutionCompleted, "ExecutionCompleted");
from_response!(MetadataFetched, MetadataFetched, "MetadataFetched");
from_response!(ResultRangeFetched, ResultRangeFetched, "ResultRangeFetched");
from_response!(EnvironmentVariablesListed, EnvironmentVariablesListed, "EnvironmentVariablesListed");
from_response!(PutFileResponse, PutFile, "PutFileResponse");
from_response!(DeployResponse, Deploy, "DeployResponse");
from_response!(ExchangeVersionsResponse, ExchangeVersions, "ExchangeVersionsResponse");
