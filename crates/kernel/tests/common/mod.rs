#![allow(dead_code)]

pub mod mock_evaluator;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use jotter_kernel::{
    channels::{ChannelHandle, ChannelReceiver},
    launch, ChannelPorts, ConnectionInfo, ExecutionSession, KernelConfig, KernelHandle,
    KernelChannels, KernelOptions,
};
use jotter_libraries::{HttpFetcher, LibraryResolver};
use jotter_protocol::{
    content::{ExecuteRequest, ExecutionState},
    Message, MessageContent, MessageData,
};
use tokio::time::timeout;

use mock_evaluator::{Journal, MockEvaluator};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestKernel {
    pub handle: KernelHandle,
    pub shell: ChannelHandle,
    pub control: ChannelHandle,
    pub stdin: ChannelHandle,
    pub iopub: ChannelReceiver,
    pub journal: Arc<Mutex<Journal>>,
}

pub fn start_kernel() -> TestKernel {
    start_kernel_with(KernelOptions::default())
}

/// Launches the dispatcher on in-memory channels with a [`MockEvaluator`].
pub fn start_kernel_with(options: KernelOptions) -> TestKernel {
    let config = KernelConfig::new(ConnectionInfo::local(ChannelPorts::default(), "secret"), options).unwrap();
    let journal = Arc::new(Mutex::new(Journal::default()));

    let resolver = LibraryResolver::new(config.resolver.clone(), Arc::new(HttpFetcher::new()));
    let session = ExecutionSession::new(Box::new(MockEvaluator::new(journal.clone())), resolver)
        .with_interrupt_policy(config.interrupt_policy)
        .with_classpath(config.classpath.clone());

    let (channels, peer) = KernelChannels::pair();
    let handle = launch(Arc::new(config), session, channels);

    TestKernel {
        handle,
        shell: peer.shell,
        control: peer.control,
        stdin: peer.stdin,
        iopub: peer.iopub,
        journal,
    }
}

pub fn request(content: impl Into<MessageContent>) -> Message {
    Message::new(
        vec![Bytes::from_static(b"frontend")],
        MessageData::new(content.into(), "frontend-session", "tester"),
    )
}

pub fn execute(code: &str) -> Message {
    request(ExecuteRequest::new(code))
}

pub async fn next_reply(handle: &mut ChannelHandle) -> Message {
    timeout(WAIT, handle.recv())
        .await
        .expect("no reply in time")
        .expect("channel closed")
}

/// Collects iopub traffic caused by `parent` up to and including its idle status.
pub async fn broadcasts_until_idle(iopub: &mut ChannelReceiver, parent: &Message) -> Vec<Message> {
    let parent_id = parent.header().msg_id.as_str();
    let mut collected = Vec::new();

    loop {
        let message = timeout(WAIT, iopub.recv())
            .await
            .expect("no idle status in time")
            .expect("iopub closed");
        if message.parent_id() != Some(parent_id) {
            continue;
        }

        let is_idle = matches!(
            message.content(),
            MessageContent::Status(status) if status.execution_state == ExecutionState::Idle
        );
        collected.push(message);
        if is_idle {
            return collected;
        }
    }
}

pub fn message_types(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .map(|message| message.message_type().to_string())
        .collect()
}

pub fn stdout_text(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|message| match message.content() {
            MessageContent::Stream(stream) => Some(stream.text.as_str()),
            _ => None,
        })
        .collect()
}
