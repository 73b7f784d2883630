//! ZeroMQ side of the kernel: one task per socket.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use jotter_protocol::{decode, encode, Channel, Message, Signer};
use tokio::{
    task::{self, JoinHandle},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeromq::{
    PubSocket, RepSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqError, ZmqMessage,
};

use crate::{
    channels::{ChannelHandle, ChannelReceiver, PeerChannels},
    config::KernelConfig,
    KernelError,
};

/// Pause after a failed receive before polling the socket again.
const RECV_BACKOFF: Duration = Duration::from_millis(100);

pub struct KernelSockets {
    tasks: Vec<JoinHandle<()>>,
    stop: CancellationToken,
}

impl KernelSockets {
    /// Binds all five sockets and starts bridging them to `peer`.
    pub async fn bind(config: &KernelConfig, peer: PeerChannels) -> Result<Self, KernelError> {
        let signer = Arc::new(config.signer.clone());
        let stop = CancellationToken::new();

        let shell = bind(RouterSocket::new(), config, Channel::Shell).await?;
        let control = bind(RouterSocket::new(), config, Channel::Control).await?;
        let stdin = bind(RouterSocket::new(), config, Channel::Stdin).await?;
        let iopub = bind(PubSocket::new(), config, Channel::IoPub).await?;
        let heartbeat = bind(RepSocket::new(), config, Channel::Heartbeat).await?;

        let tasks = vec![
            task::spawn(run_router(shell, peer.shell, signer.clone(), stop.clone())),
            task::spawn(run_router(control, peer.control, signer.clone(), stop.clone())),
            task::spawn(run_router(stdin, peer.stdin, signer.clone(), stop.clone())),
            task::spawn(run_iopub(iopub, peer.iopub, signer)),
            task::spawn(run_heartbeat(heartbeat, stop.clone())),
        ];

        info!(ip = %config.ip, transport = %config.transport, "kernel sockets bound");

        Ok(Self { tasks, stop })
    }

    /// Flushes queued outgoing messages and stops every socket task.
    pub async fn close(self) {
        self.stop.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "socket task failed");
            }
        }
    }
}

async fn bind<S: Socket>(mut socket: S, config: &KernelConfig, channel: Channel) -> Result<S, KernelError> {
    let endpoint = config.endpoint(channel);
    socket
        .bind(&endpoint)
        .await
        .map_err(|source| KernelError::Bind {
            channel,
            endpoint: endpoint.clone(),
            source,
        })?;

    debug!(%channel, %endpoint, "bound");
    Ok(socket)
}

fn to_frames(message: &Message, signer: &Signer) -> Option<ZmqMessage> {
    let frames = match encode(message, signer) {
        Ok(frames) => frames,
        Err(e) => {
            error!(error = %e, msg_type = message.message_type(), "could not encode message");
            return None;
        }
    };

    ZmqMessage::try_from(frames)
        .map_err(|e| error!(error = %e, "could not build zmq message"))
        .ok()
}

async fn send_to_router(socket: &mut RouterSocket, message: &Message, signer: &Signer) {
    let Some(frames) = to_frames(message, signer) else {
        return;
    };

    if let Err(e) = socket.send(frames).await {
        warn!(error = %e, msg_type = message.message_type(), "send failed");
    }
}

/// Incoming frames are decoded and verified; anything malformed or wrongly
/// signed is dropped without a reply.
async fn run_router(
    mut socket: RouterSocket,
    mut peer: ChannelHandle,
    signer: Arc<Signer>,
    stop: CancellationToken,
) {
    let channel = peer.channel();

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                while let Some(message) = peer.try_recv() {
                    send_to_router(&mut socket, &message, &signer).await;
                }
                break;
            }
            outgoing = peer.recv() => match outgoing {
                Some(message) => send_to_router(&mut socket, &message, &signer).await,
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Ok(frames) => {
                    let frames: Vec<Bytes> = frames.into_vec();
                    match decode(frames, &signer) {
                        Ok(message) => {
                            if peer.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.is_auth() => warn!(%channel, "dropping message with a bad signature"),
                        Err(e) => warn!(%channel, error = %e, "dropping malformed message"),
                    }
                }
                Err(e) if is_fatal(&e) => {
                    error!(%channel, error = %e, "socket can no longer receive");
                    break;
                }
                Err(e) => {
                    warn!(%channel, error = %e, "receive failed");
                    time::sleep(RECV_BACKOFF).await;
                }
            },
        }
    }

    debug!(%channel, "socket task stopped");
}

/// Ends when every publisher is gone, so nothing published is lost.
async fn run_iopub(mut socket: PubSocket, mut broadcasts: ChannelReceiver, signer: Arc<Signer>) {
    while let Some(message) = broadcasts.recv().await {
        let Some(frames) = to_frames(&message, &signer) else {
            continue;
        };
        if let Err(e) = socket.send(frames).await {
            warn!(error = %e, msg_type = message.message_type(), "publish failed");
        }
    }

    debug!("iopub task stopped");
}

async fn run_heartbeat(mut socket: RepSocket, stop: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => break,
            ping = socket.recv() => match ping {
                Ok(ping) => {
                    if let Err(e) = socket.send(ping).await {
                        warn!(error = %e, "heartbeat echo failed");
                    }
                }
                Err(e) if is_fatal(&e) => {
                    error!(error = %e, "heartbeat socket can no longer receive");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "heartbeat receive failed");
                    time::sleep(RECV_BACKOFF).await;
                }
            },
        }
    }
}

/// Errors after which the socket will never deliver another message.
fn is_fatal(e: &ZmqError) -> bool {
    matches!(e, ZmqError::NoMessage | ZmqError::Task(_))
}
