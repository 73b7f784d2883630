use std::sync::Arc;

use bytes::Bytes;
use jotter_protocol::{
    content::{DisplayData, InputRequest, StreamName, UpdateDisplayData},
    Header, Message, MessageContent, MessageData,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{channels::ChannelHandle, evaluator::EvalError, IopubPublisher};

/// What a running cell can do to the outside world.
///
/// Output is published on iopub right away, parented on the request being
/// executed, so it always reaches the frontend ahead of the reply.
#[derive(Debug, Clone)]
pub struct ExecutionHost {
    iopub: IopubPublisher,
    parent: Header,
    identities: Vec<Bytes>,
    stdin: Option<Arc<Mutex<ChannelHandle>>>,
    sigint: CancellationToken,
}

impl ExecutionHost {
    pub fn new(iopub: IopubPublisher, parent: Header, sigint: CancellationToken) -> Self {
        Self {
            iopub,
            parent,
            identities: Vec::new(),
            stdin: None,
            sigint,
        }
    }

    /// Lets the cell ask the frontend for input, routed to `identities`.
    pub fn with_stdin(mut self, stdin: Arc<Mutex<ChannelHandle>>, identities: Vec<Bytes>) -> Self {
        self.stdin = Some(stdin);
        self.identities = identities;
        self
    }

    pub fn parent(&self) -> &Header {
        &self.parent
    }

    pub fn publish(&self, content: impl Into<MessageContent>) {
        self.iopub.publish(&self.parent, content);
    }

    pub fn stream(&self, name: StreamName, text: impl Into<String>) {
        self.publish(MessageContent::stream(name, text));
    }

    pub fn stdout(&self, text: impl Into<String>) {
        self.stream(StreamName::Stdout, text);
    }

    pub fn stderr(&self, text: impl Into<String>) {
        self.stream(StreamName::Stderr, text);
    }

    pub fn display(&self, display: DisplayData) {
        self.publish(display);
    }

    pub fn update_display(&self, display: DisplayData) {
        self.publish(UpdateDisplayData { display });
    }

    pub fn interrupted(&self) -> &CancellationToken {
        &self.sigint
    }

    pub fn is_interrupted(&self) -> bool {
        self.sigint.is_cancelled()
    }

    /// Sends an input_request on stdin and waits for the matching input_reply.
    pub async fn read_input(&self, prompt: &str, password: bool) -> Result<String, EvalError> {
        let Some(stdin) = &self.stdin else {
            return Err(EvalError::failed(
                "StdinNotAllowed",
                "input was requested but the frontend does not accept input requests",
            ));
        };

        let mut stdin = stdin.lock().await;
        let request = Message::new(
            self.identities.clone(),
            MessageData::caused_by(
                &self.parent,
                InputRequest {
                    prompt: prompt.to_string(),
                    password,
                }
                .into(),
            ),
        );
        let request_id = request.header().msg_id.clone();
        stdin
            .send(request)
            .map_err(|e| EvalError::Process(e.to_string()))?;

        loop {
            let message = tokio::select! {
                biased;
                _ = self.sigint.cancelled() => return Err(EvalError::Interrupted),
                message = stdin.recv() => message,
            };

            let Some(message) = message else {
                return Err(EvalError::Process("stdin channel closed".to_string()));
            };

            match message.content() {
                MessageContent::InputReply(reply) if message.parent_id() == Some(request_id.as_str()) => {
                    return Ok(reply.value.clone());
                }
                // Replies without a parent come from frontends that do not set one.
                MessageContent::InputReply(reply) if message.parent_id().is_none() => {
                    return Ok(reply.value.clone());
                }
                _ => debug!(msg_type = message.message_type(), "ignoring stray stdin message"),
            }
        }
    }
}
