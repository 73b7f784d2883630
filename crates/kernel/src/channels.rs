//! In-process message queues between the socket tasks and the dispatcher.
//!
//! Every framed channel is a pair of [`ChannelHandle`]s: what one side sends,
//! the other receives. The socket layer holds the peer side and bridges it to
//! ZeroMQ; tests hold it directly and act as the frontend.

use jotter_protocol::{Channel, Header, Message, MessageContent};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::debug;

use crate::ChannelError;

#[derive(Debug, Clone)]
pub struct ChannelSender {
    channel: Channel,
    sender: mpsc::UnboundedSender<Message>,
}

impl ChannelSender {
    pub fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.sender
            .send(message)
            .map_err(|_| ChannelError::Closed(self.channel))
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }
}

#[derive(Debug)]
pub struct ChannelReceiver {
    channel: Channel,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl ChannelReceiver {
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// `None` when nothing is queued right now, or when the channel is closed.
    pub fn try_recv(&mut self) -> Option<Message> {
        match self.receiver.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }
}

#[derive(Debug)]
pub struct ChannelHandle {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl ChannelHandle {
    /// Two connected ends of `channel`.
    pub fn pair(channel: Channel) -> (ChannelHandle, ChannelHandle) {
        let (left_sender, right_receiver) = mpsc::unbounded_channel();
        let (right_sender, left_receiver) = mpsc::unbounded_channel();

        let end = |sender, receiver| ChannelHandle {
            sender: ChannelSender { channel, sender },
            receiver: ChannelReceiver { channel, receiver },
        };

        (
            end(left_sender, left_receiver),
            end(right_sender, right_receiver),
        )
    }

    pub fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.sender.send(message)
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv()
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }

    pub fn channel(&self) -> Channel {
        self.sender.channel
    }
}

/// Send-only side of iopub. Clones share one queue, so broadcasts leave in the
/// order they were published no matter which task published them.
#[derive(Debug, Clone)]
pub struct IopubPublisher {
    sender: mpsc::UnboundedSender<Message>,
}

impl IopubPublisher {
    pub fn channel() -> (IopubPublisher, ChannelReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();

        (
            IopubPublisher { sender },
            ChannelReceiver {
                channel: Channel::IoPub,
                receiver,
            },
        )
    }

    pub fn publish(&self, parent: &Header, content: impl Into<MessageContent>) {
        let message = Message::broadcast(parent, content.into());
        if self.sender.send(message).is_err() {
            debug!("iopub is closed, dropping broadcast");
        }
    }
}

/// The kernel's ends of all framed channels.
#[derive(Debug)]
pub struct KernelChannels {
    pub shell: ChannelHandle,
    pub control: ChannelHandle,
    pub stdin: ChannelHandle,
    pub iopub: IopubPublisher,
}

/// The frontend's ends, as seen by the socket layer or a test.
#[derive(Debug)]
pub struct PeerChannels {
    pub shell: ChannelHandle,
    pub control: ChannelHandle,
    pub stdin: ChannelHandle,
    pub iopub: ChannelReceiver,
}

impl KernelChannels {
    pub fn pair() -> (KernelChannels, PeerChannels) {
        let (shell, peer_shell) = ChannelHandle::pair(Channel::Shell);
        let (control, peer_control) = ChannelHandle::pair(Channel::Control);
        let (stdin, peer_stdin) = ChannelHandle::pair(Channel::Stdin);
        let (iopub, peer_iopub) = IopubPublisher::channel();

        (
            KernelChannels {
                shell,
                control,
                stdin,
                iopub,
            },
            PeerChannels {
                shell: peer_shell,
                control: peer_control,
                stdin: peer_stdin,
                iopub: peer_iopub,
            },
        )
    }
}
