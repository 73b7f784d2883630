//! Routes decoded requests to the session.
//!
//! Shell requests are serialized through one actor that owns the
//! [`ExecutionSession`]. Control requests are served by a second task so an
//! interrupt or shutdown can reach the kernel while a cell is running.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use jotter_protocol::{
    content::{
        CommInfoReply, ExecuteReply, ExecutionState, HistoryReply, InterruptReply,
        KernelInfoReply, ListErrorsReply, ReplyStatus, ShutdownReply,
    },
    Header, Message, MessageContent,
};
use serde_json::Map;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{self, JoinHandle},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channels::{ChannelHandle, ChannelReceiver, ChannelSender, KernelChannels},
    config::KernelConfig,
    host::ExecutionHost,
    session::{ExecutionSession, ABORT_TIMEOUT},
    IopubPublisher,
};

const KERNEL_USERNAME: &str = "kernel";

/// Longest the control channel waits for the shell to stop. The in-flight
/// request, library cleanup and evaluator shutdown get one grace period each,
/// and up to two aborts run in between.
fn shutdown_deadline(grace: Duration) -> Duration {
    grace * 3 + ABORT_TIMEOUT * 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Idle,
    Busy,
    /// Terminal.
    ShuttingDown,
}

/// State shared by the dispatcher tasks and the [`KernelHandle`].
struct Lifecycle {
    state: watch::Sender<KernelState>,
    sigint: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    /// Bumped whenever a failing execute with `stop_on_error` aborts the queue.
    abort_epoch: AtomicU64,
}

impl Lifecycle {
    fn new() -> Self {
        let (state, _) = watch::channel(KernelState::Idle);
        Self {
            state,
            sigint: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
            abort_epoch: AtomicU64::new(0),
        }
    }

    fn set_state(&self, next: KernelState) {
        self.state.send_if_modified(|state| {
            if *state == KernelState::ShuttingDown || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    /// A fresh interrupt token for the execution about to start.
    fn arm_sigint(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.sigint.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    fn interrupt(&self) {
        self.sigint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    fn begin_shutdown(&self) {
        self.set_state(KernelState::ShuttingDown);
        self.shutdown.cancel();
    }

    fn epoch(&self) -> u64 {
        self.abort_epoch.load(Ordering::SeqCst)
    }

    fn abort_pending(&self) {
        self.abort_epoch.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct KernelHandle {
    lifecycle: Arc<Lifecycle>,
    state: watch::Receiver<KernelState>,
    tasks: Vec<JoinHandle<()>>,
}

impl KernelHandle {
    pub fn state(&self) -> KernelState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<KernelState> {
        self.state.clone()
    }

    /// Same effect as an interrupt_request on control.
    pub fn interrupt(&self) {
        self.lifecycle.interrupt();
    }

    /// Shuts the kernel down without a shutdown_request, e.g. on ctrl-c.
    pub fn shutdown(&self) {
        self.lifecycle.begin_shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.shutdown.is_cancelled()
    }

    /// Resolves once shutdown has begun, however it was requested.
    pub async fn stopped(&self) {
        self.lifecycle.shutdown.cancelled().await;
    }

    /// Resolves once every dispatcher task has stopped.
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "dispatcher task failed");
            }
        }
    }
}

pub fn launch(
    config: Arc<KernelConfig>,
    session: ExecutionSession,
    channels: KernelChannels,
) -> KernelHandle {
    let lifecycle = Arc::new(Lifecycle::new());
    let state = lifecycle.state.subscribe();
    let kernel_info = Arc::new(session.kernel_info());

    let KernelChannels {
        shell,
        control,
        stdin,
        iopub,
    } = channels;
    let (shell_replies, shell_requests) = shell.split();

    let (work_sender, work_receiver) = mpsc::channel(config.queue_capacity);
    let (shell_done_sender, shell_done_receiver) = oneshot::channel();

    let router = task::spawn(route_shell(shell_requests, work_sender, lifecycle.clone()));

    let actor = ShellActor {
        session,
        replies: shell_replies,
        iopub,
        stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
        lifecycle: lifecycle.clone(),
        kernel_info: kernel_info.clone(),
        session_id: config.session_id.clone(),
        pending_shutdown: None,
    };
    let shell = task::spawn(run_shell(
        actor,
        work_receiver,
        config.shutdown_grace,
        shell_done_sender,
    ));

    let control = task::spawn(run_control(
        control,
        lifecycle.clone(),
        kernel_info,
        shell_done_receiver,
        config.shutdown_grace,
    ));

    info!(session = %config.session_id, "kernel dispatcher started");

    KernelHandle {
        lifecycle,
        state,
        tasks: vec![router, shell, control],
    }
}

struct ShellWork {
    request: Message,
    epoch: u64,
}

/// Stamps each shell request with the abort epoch current at arrival and
/// queues it for the shell actor.
async fn route_shell(
    mut requests: ChannelReceiver,
    work_sender: mpsc::Sender<ShellWork>,
    lifecycle: Arc<Lifecycle>,
) {
    loop {
        let request = tokio::select! {
            biased;

            _ = lifecycle.shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let work = ShellWork {
            request,
            epoch: lifecycle.epoch(),
        };
        if work_sender.send(work).await.is_err() {
            break;
        }
    }
}

struct ShellActor {
    session: ExecutionSession,
    replies: ChannelSender,
    iopub: IopubPublisher,
    stdin: Arc<tokio::sync::Mutex<ChannelHandle>>,
    lifecycle: Arc<Lifecycle>,
    kernel_info: Arc<KernelInfoReply>,
    session_id: String,
    /// A shutdown_request that arrived on shell; answered once the session is down.
    pending_shutdown: Option<Message>,
}

impl ShellActor {
    fn handles(message_type: &str) -> bool {
        matches!(
            message_type,
            "execute_request"
                | "complete_request"
                | "inspect_request"
                | "is_complete_request"
                | "kernel_info_request"
                | "history_request"
                | "comm_info_request"
                | "list_errors_request"
                | "shutdown_request"
        )
    }

    fn reply(&self, request: &Message, content: impl Into<MessageContent>) {
        if let Err(e) = self.replies.send(request.reply(content.into())) {
            warn!(error = %e, "could not send shell reply");
        }
    }

    fn publish_state(&self, request: &Message, state: ExecutionState) {
        self.iopub
            .publish(request.header(), MessageContent::status(state));
    }

    async fn handle(&mut self, work: &ShellWork) {
        let request = &work.request;

        match request.content() {
            MessageContent::ExecuteRequest(execute) => {
                if work.epoch < self.lifecycle.epoch() {
                    debug!(msg_id = %request.header().msg_id, "aborting execute queued before a failure");
                    self.reply(request, ExecuteReply::aborted(self.session.execution_count()));
                    return;
                }

                let mut host = ExecutionHost::new(
                    self.iopub.clone(),
                    request.header().clone(),
                    self.lifecycle.arm_sigint(),
                );
                if execute.allow_stdin {
                    host = host.with_stdin(self.stdin.clone(), request.identities.clone());
                }

                let reply = self.session.execute(execute, &host).await;
                if reply.status != ReplyStatus::Ok && execute.stop_on_error {
                    self.lifecycle.abort_pending();
                }
                self.reply(request, reply);
            }
            MessageContent::CompleteRequest(complete) => {
                let reply = self.session.complete(&complete.code, complete.cursor_pos).await;
                self.reply(request, reply);
            }
            MessageContent::InspectRequest(inspect) => {
                let reply = self
                    .session
                    .inspect(&inspect.code, inspect.cursor_pos, inspect.detail_level)
                    .await;
                self.reply(request, reply);
            }
            MessageContent::IsCompleteRequest(is_complete) => {
                let reply = self.session.is_complete(&is_complete.code).await;
                self.reply(request, reply);
            }
            MessageContent::KernelInfoRequest(_) => {
                self.reply(request, self.kernel_info.as_ref().clone());
            }
            MessageContent::HistoryRequest(history) => {
                self.reply(
                    request,
                    HistoryReply {
                        status: ReplyStatus::Ok,
                        history: self.session.history(history),
                    },
                );
            }
            MessageContent::CommInfoRequest(_) => {
                self.reply(
                    request,
                    CommInfoReply {
                        status: ReplyStatus::Ok,
                        comms: Map::new(),
                    },
                );
            }
            MessageContent::ListErrorsRequest(list) => {
                let errors = self.session.list_errors(&list.code).await;
                self.reply(
                    request,
                    ListErrorsReply {
                        code: list.code.clone(),
                        errors,
                    },
                );
            }
            MessageContent::ShutdownRequest(_) => {
                info!("shutdown requested on shell");
                self.lifecycle.begin_shutdown();
                self.pending_shutdown = Some(request.clone());
            }
            other => debug!(msg_type = other.message_type(), "ignoring shell message"),
        }
    }

    /// Called when the grace period ran out with `request` still in flight.
    async fn abandon(&mut self, request: &Message) {
        warn!(msg_id = %request.header().msg_id, "request did not finish before shutdown");
        self.lifecycle.interrupt();
        self.session.abort().await;
        if let MessageContent::ExecuteRequest(_) = request.content() {
            self.reply(request, ExecuteReply::aborted(self.session.execution_count()));
        }
    }

    async fn shut_down(&mut self, grace: Duration) {
        let parent = match &self.pending_shutdown {
            Some(request) => request.header().clone(),
            None => Header::new("shutdown_request", self.session_id.clone(), KERNEL_USERNAME),
        };
        let host = ExecutionHost::new(self.iopub.clone(), parent, self.lifecycle.arm_sigint());

        self.session.shutdown(&host, grace).await;

        if let Some(request) = self.pending_shutdown.take() {
            let restart = match request.content() {
                MessageContent::ShutdownRequest(shutdown) => shutdown.restart,
                _ => false,
            };
            self.reply(
                &request,
                ShutdownReply {
                    status: ReplyStatus::Ok,
                    restart,
                },
            );
        }
    }
}

async fn run_shell(
    mut actor: ShellActor,
    mut work_receiver: mpsc::Receiver<ShellWork>,
    grace: Duration,
    shell_done: oneshot::Sender<()>,
) {
    let shutdown = actor.lifecycle.shutdown.clone();

    loop {
        let work = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            work = work_receiver.recv() => match work {
                Some(work) => work,
                None => break,
            },
        };

        if !ShellActor::handles(work.request.message_type()) {
            warn!(msg_type = work.request.message_type(), "unknown shell message type");
            continue;
        }

        actor.lifecycle.set_state(KernelState::Busy);
        actor.publish_state(&work.request, ExecutionState::Busy);

        let finished = {
            let handling = actor.handle(&work);
            tokio::pin!(handling);

            tokio::select! {
                biased;

                _ = &mut handling => true,
                _ = shutdown.cancelled() => time::timeout(grace, &mut handling).await.is_ok(),
            }
        };
        if !finished {
            actor.abandon(&work.request).await;
        }

        actor.publish_state(&work.request, ExecutionState::Idle);
        actor.lifecycle.set_state(KernelState::Idle);
    }

    let dropped = std::iter::from_fn(|| work_receiver.try_recv().ok()).count();
    if dropped > 0 {
        debug!(dropped, "discarding shell requests queued at shutdown");
    }

    actor.shut_down(grace).await;
    let _ = shell_done.send(());
    info!("shell stopped");
}

async fn run_control(
    mut control: ChannelHandle,
    lifecycle: Arc<Lifecycle>,
    kernel_info: Arc<KernelInfoReply>,
    shell_done: oneshot::Receiver<()>,
    grace: Duration,
) {
    let mut shell_done = Some(shell_done);

    loop {
        let request = tokio::select! {
            biased;

            _ = lifecycle.shutdown.cancelled() => break,
            request = control.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let reply = |content: MessageContent| {
            if let Err(e) = control.send(request.reply(content)) {
                warn!(error = %e, "could not send control reply");
            }
        };

        match request.content() {
            MessageContent::InterruptRequest(_) => {
                info!("interrupt requested");
                lifecycle.interrupt();
                reply(
                    InterruptReply {
                        status: ReplyStatus::Ok,
                    }
                    .into(),
                );
            }
            MessageContent::KernelInfoRequest(_) => {
                reply(kernel_info.as_ref().clone().into());
            }
            MessageContent::ShutdownRequest(shutdown) => {
                info!(restart = shutdown.restart, "shutdown requested");
                lifecycle.begin_shutdown();
                if let Some(done) = shell_done.take() {
                    if time::timeout(shutdown_deadline(grace), done).await.is_err() {
                        warn!("shell did not stop in time, replying anyway");
                    }
                }
                reply(
                    ShutdownReply {
                        status: ReplyStatus::Ok,
                        restart: shutdown.restart,
                    }
                    .into(),
                );
                break;
            }
            other => debug!(msg_type = other.message_type(), "ignoring control message"),
        }
    }
}
