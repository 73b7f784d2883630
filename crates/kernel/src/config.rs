use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use jotter_libraries::{GitHubRepository, ResolutionInfo, ResolverConfig};
use jotter_protocol::{Channel, SignatureError, SignatureScheme, Signer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
const LIBRARIES_DIR: &str = "libraries";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read connection file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid connection file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("connection file has an empty key; pass --allow-unsigned to accept unsigned messages")]
    UnsignedNotAllowed,
    #[error("unsupported transport `{0}`")]
    Transport(String),
    #[error("unknown interrupt policy `{0}`, expected `cooperative` or `abandon`")]
    InterruptPolicy(String),
}

/// The Jupyter connection file handed over by the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub transport: String,
    pub shell_port: u16,
    pub control_port: u16,
    pub stdin_port: u16,
    pub iopub_port: u16,
    pub hb_port: u16,
    #[serde(default = "default_scheme")]
    pub signature_scheme: String,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

fn default_scheme() -> String {
    SignatureScheme::default().as_str().to_string()
}

impl ConnectionInfo {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loopback tcp connection on the given ports.
    pub fn local(ports: ChannelPorts, key: impl Into<String>) -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            transport: "tcp".to_string(),
            shell_port: ports.shell,
            control_port: ports.control,
            stdin_port: ports.stdin,
            iopub_port: ports.iopub,
            hb_port: ports.heartbeat,
            signature_scheme: default_scheme(),
            key: key.into(),
            kernel_name: None,
        }
    }

    pub fn ports(&self) -> ChannelPorts {
        ChannelPorts {
            shell: self.shell_port,
            control: self.control_port,
            stdin: self.stdin_port,
            iopub: self.iopub_port,
            heartbeat: self.hb_port,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelPorts {
    pub shell: u16,
    pub control: u16,
    pub stdin: u16,
    pub iopub: u16,
    pub heartbeat: u16,
}

impl ChannelPorts {
    pub fn port(&self, channel: Channel) -> u16 {
        match channel {
            Channel::Shell => self.shell,
            Channel::Control => self.control,
            Channel::Stdin => self.stdin,
            Channel::IoPub => self.iopub,
            Channel::Heartbeat => self.heartbeat,
        }
    }
}

/// What an interrupt does to a running cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InterruptPolicy {
    /// The evaluator observes the interrupt token and returns on its own.
    #[default]
    Cooperative,
    /// The kernel stops waiting for the evaluator and reports the cell as interrupted.
    Abandon,
}

impl FromStr for InterruptPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cooperative" => Ok(InterruptPolicy::Cooperative),
            "abandon" => Ok(InterruptPolicy::Abandon),
            _ => Err(ConfigError::InterruptPolicy(s.to_string())),
        }
    }
}

/// Settings that do not come from the connection file.
#[derive(Debug, Clone)]
pub struct KernelOptions {
    pub home_dir: Option<PathBuf>,
    pub classpath: Vec<PathBuf>,
    /// Defaults to `<home>/libraries`.
    pub libraries_dir: Option<PathBuf>,
    /// Fallback for `%use` of a bare library name.
    pub resolution: Option<ResolutionInfo>,
    pub descriptors_repository: GitHubRepository,
    pub interrupt_policy: InterruptPolicy,
    pub allow_unsigned: bool,
    pub shutdown_grace: Duration,
    pub queue_capacity: usize,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            home_dir: None,
            classpath: Vec::new(),
            libraries_dir: None,
            resolution: None,
            descriptors_repository: GitHubRepository::default(),
            interrupt_policy: InterruptPolicy::default(),
            allow_unsigned: false,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub ip: String,
    pub transport: String,
    pub ports: ChannelPorts,
    pub signer: Signer,
    pub kernel_name: Option<String>,
    /// Session id of messages the kernel originates itself.
    pub session_id: String,
    pub home_dir: Option<PathBuf>,
    pub classpath: Vec<PathBuf>,
    pub resolver: ResolverConfig,
    pub interrupt_policy: InterruptPolicy,
    pub shutdown_grace: Duration,
    pub queue_capacity: usize,
}

impl KernelConfig {
    pub fn new(info: ConnectionInfo, options: KernelOptions) -> Result<Self, ConfigError> {
        if !matches!(info.transport.as_str(), "tcp" | "ipc") {
            return Err(ConfigError::Transport(info.transport));
        }

        let scheme: SignatureScheme = info.signature_scheme.parse()?;
        if info.key.is_empty() && !options.allow_unsigned {
            return Err(ConfigError::UnsignedNotAllowed);
        }
        let signer = Signer::new(scheme, info.key.as_bytes())?;

        let libraries_dir = options
            .libraries_dir
            .or_else(|| options.home_dir.as_ref().map(|home| home.join(LIBRARIES_DIR)));
        let initial = options.resolution.unwrap_or_else(|| ResolutionInfo::ByGitRef {
            repository: options.descriptors_repository.clone(),
            git_ref: jotter_libraries::resolution::DEFAULT_BRANCH.to_string(),
        });

        Ok(Self {
            ports: info.ports(),
            ip: info.ip,
            transport: info.transport,
            signer,
            kernel_name: info.kernel_name,
            session_id: Uuid::new_v4().to_string(),
            home_dir: options.home_dir,
            classpath: options.classpath,
            resolver: ResolverConfig {
                initial,
                local_libraries_dir: libraries_dir,
                repository: options.descriptors_repository,
            },
            interrupt_policy: options.interrupt_policy,
            shutdown_grace: options.shutdown_grace,
            queue_capacity: options.queue_capacity.max(1),
        })
    }

    /// `tcp://ip:port`, or `ipc://ip-port` for the ipc transport.
    pub fn endpoint(&self, channel: Channel) -> String {
        let port = self.ports.port(channel);
        match self.transport.as_str() {
            "ipc" => format!("ipc://{}-{port}", self.ip),
            transport => format!("{transport}://{}:{port}", self.ip),
        }
    }
}
