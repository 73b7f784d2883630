pub mod channels;
pub mod config;
pub mod dispatcher;
pub mod evaluator;
pub mod host;
pub mod ports;
pub mod process;
pub mod session;
pub mod sockets;

pub use channels::{ChannelHandle, IopubPublisher, KernelChannels, PeerChannels};
pub use config::{
    ChannelPorts, ConfigError, ConnectionInfo, InterruptPolicy, KernelConfig, KernelOptions,
};
pub use dispatcher::{launch, KernelHandle, KernelState};
pub use evaluator::{EvalError, EvalOutput, EvalRequest, Evaluator};
pub use host::ExecutionHost;
pub use ports::{PortError, PortRegistry};
pub use process::ProcessEvaluator;
pub use session::ExecutionSession;

use std::{io, sync::Arc};

use jotter_libraries::{HttpFetcher, LibraryResolver};
use jotter_protocol::Channel;
use sockets::KernelSockets;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChannelError {
    #[error("{0} channel is closed")]
    Closed(Channel),
}

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("failed to bind {channel} socket to {endpoint}: {source}")]
    Bind {
        channel: Channel,
        endpoint: String,
        #[source]
        source: zeromq::ZmqError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Evaluator(#[from] EvalError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A running kernel: the dispatcher plus the sockets feeding it.
pub struct Kernel {
    handle: KernelHandle,
    sockets: KernelSockets,
}

impl Kernel {
    pub async fn start(config: KernelConfig, evaluator: Box<dyn Evaluator>) -> Result<Self, KernelError> {
        let config = Arc::new(config);
        let (channels, peer) = KernelChannels::pair();
        let sockets = KernelSockets::bind(&config, peer).await?;

        let resolver = LibraryResolver::new(config.resolver.clone(), Arc::new(HttpFetcher::new()));
        let session = ExecutionSession::new(evaluator, resolver)
            .with_interrupt_policy(config.interrupt_policy)
            .with_classpath(config.classpath.clone());

        let handle = launch(config.clone(), session, channels);
        info!(kernel = config.kernel_name.as_deref().unwrap_or("jotter"), "kernel started");

        Ok(Self { handle, sockets })
    }

    pub fn handle(&self) -> &KernelHandle {
        &self.handle
    }

    /// Resolves after shutdown, once pending replies have been flushed.
    pub async fn wait(self) {
        self.handle.wait().await;
        self.sockets.close().await;
    }
}
