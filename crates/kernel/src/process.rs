//! Drives an external evaluator over JSON lines.
//!
//! Every request is one line on the child's stdin carrying an `id` and an
//! `op`. The child answers with event lines tagged by the same `id`:
//! `stream`, `display` and `input` may come any number of times during an
//! evaluation, which then ends with exactly one `result` or `error`. All other
//! operations end with a single `reply`.

use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use jotter_protocol::content::{
    CompleteReply, Diagnostic, DisplayData, InspectReply, IsCompleteReply, LanguageInfo,
    StreamName,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time,
};
use tracing::{debug, warn};

use crate::{
    evaluator::{CompilationSetup, EvalError, EvalOutput, EvalRequest, Evaluator},
    host::ExecutionHost,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Info,
    Evaluate {
        code: &'a str,
        execution_count: u32,
        store_history: bool,
    },
    Configure {
        repositories: &'a [String],
        dependencies: &'a [String],
        compiler_arguments: &'a [String],
        classpath: &'a [PathBuf],
    },
    Complete {
        code: &'a str,
        cursor_pos: usize,
    },
    IsComplete {
        code: &'a str,
    },
    ListErrors {
        code: &'a str,
    },
    Inspect {
        code: &'a str,
        cursor_pos: usize,
        detail_level: u8,
    },
    InputReply {
        value: &'a str,
    },
    Interrupt,
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event {
    Stream {
        name: StreamName,
        text: String,
    },
    Display {
        data: Map<String, Value>,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default)]
        display_id: Option<String>,
        #[serde(default)]
        update: bool,
    },
    Input {
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        password: bool,
    },
    Result {
        #[serde(default)]
        data: Option<Map<String, Value>>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    Reply {
        #[serde(default)]
        value: Value,
    },
}

pub struct ProcessEvaluator {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    /// Id of the evaluation in progress; left set when its future is dropped.
    running: Option<u64>,
    language_info: LanguageInfo,
}

impl ProcessEvaluator {
    /// Starts `program` and asks it for its language info.
    pub async fn spawn(program: &str, args: &[String]) -> Result<Self, EvalError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EvalError::Process(format!("failed to start `{program}`: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(EvalError::Process("evaluator pipes are not available".to_string()));
        };

        let mut evaluator = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
            running: None,
            language_info: LanguageInfo {
                name: String::new(),
                version: String::new(),
                mimetype: String::new(),
                file_extension: String::new(),
                pygments_lexer: None,
                codemirror_mode: None,
            },
        };
        evaluator.language_info = evaluator.call(&Request::Info).await?;
        debug!(language = %evaluator.language_info.name, "evaluator process started");

        Ok(evaluator)
    }

    async fn write(&mut self, id: u64, request: &Request<'_>) -> Result<(), EvalError> {
        let mut line = serde_json::to_value(request).map_err(|e| EvalError::Process(e.to_string()))?;
        if let Value::Object(fields) = &mut line {
            fields.insert("id".to_string(), Value::from(id));
        }

        let mut bytes = line.to_string().into_bytes();
        bytes.push(b'\n');

        self.stdin.write_all(&bytes).await.map_err(process_failure)?;
        self.stdin.flush().await.map_err(process_failure)
    }

    async fn send(&mut self, request: &Request<'_>) -> Result<u64, EvalError> {
        self.next_id += 1;
        let id = self.next_id;
        self.write(id, request).await?;
        Ok(id)
    }

    /// Next event for `id`; lines for other ids and unparsable lines are skipped.
    async fn next_event(&mut self, id: u64) -> Result<Event, EvalError> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(process_failure)?
                .ok_or_else(|| EvalError::Process("evaluator process exited".to_string()))?;

            let value: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "skipping unparsable evaluator output");
                    continue;
                }
            };

            if value.get("id").and_then(Value::as_u64) != Some(id) {
                debug!("skipping evaluator event for another request");
                continue;
            }

            match serde_json::from_value(value) {
                Ok(event) => return Ok(event),
                Err(e) => warn!(error = %e, "skipping unknown evaluator event"),
            }
        }
    }

    async fn call<T: DeserializeOwned>(&mut self, request: &Request<'_>) -> Result<T, EvalError> {
        let id = self.send(request).await?;

        loop {
            match self.next_event(id).await? {
                Event::Reply { value } => {
                    return serde_json::from_value(value).map_err(|e| EvalError::Process(e.to_string()))
                }
                Event::Error {
                    ename,
                    evalue,
                    traceback,
                } => {
                    return Err(EvalError::Failed {
                        ename,
                        evalue,
                        traceback,
                    })
                }
                other => debug!(?other, "ignoring event outside of an evaluation"),
            }
        }
    }

    /// Waits for the next event while forwarding the interrupt to the child once.
    async fn next_event_or_interrupt(
        &mut self,
        id: u64,
        host: &ExecutionHost,
        interrupt_sent: &mut bool,
    ) -> Result<Event, EvalError> {
        loop {
            if *interrupt_sent {
                return self.next_event(id).await;
            }

            let sigint = host.interrupted().clone();
            tokio::select! {
                biased;

                _ = sigint.cancelled() => {
                    *interrupt_sent = true;
                    self.write(id, &Request::Interrupt).await?;
                }
                event = self.next_event(id) => return event,
            }
        }
    }

    /// Forwards events for evaluation `id` until it ends with a result or an error.
    async fn run_evaluation(&mut self, id: u64, host: &ExecutionHost) -> Result<EvalOutput, EvalError> {
        let mut interrupt_sent = false;

        loop {
            match self.next_event_or_interrupt(id, host, &mut interrupt_sent).await? {
                Event::Stream { name, text } => host.stream(name, text),
                Event::Display {
                    data,
                    metadata,
                    display_id,
                    update,
                } => {
                    let mut display = DisplayData {
                        data,
                        metadata,
                        ..DisplayData::default()
                    };
                    if let Some(display_id) = display_id {
                        display = display.with_display_id(display_id);
                    }
                    if update {
                        host.update_display(display);
                    } else {
                        host.display(display);
                    }
                }
                Event::Input { prompt, password } => {
                    let value = host.read_input(&prompt, password).await;
                    let answer = value.as_deref().unwrap_or_default();
                    self.write(id, &Request::InputReply { value: answer }).await?;
                    if let Err(EvalError::Interrupted) = value {
                        interrupt_sent = true;
                        self.write(id, &Request::Interrupt).await?;
                    }
                }
                Event::Result { data, metadata } => {
                    return Ok(EvalOutput {
                        result: data.map(|data| DisplayData {
                            data,
                            metadata,
                            ..DisplayData::default()
                        }),
                    })
                }
                Event::Error {
                    ename,
                    evalue,
                    traceback,
                } => {
                    return Err(if interrupt_sent && ename == crate::evaluator::INTERRUPTED_ENAME {
                        EvalError::Interrupted
                    } else {
                        EvalError::Failed {
                            ename,
                            evalue,
                            traceback,
                        }
                    })
                }
                Event::Reply { .. } => debug!("ignoring reply during evaluation"),
            }
        }
    }
}

fn process_failure(e: std::io::Error) -> EvalError {
    EvalError::Process(e.to_string())
}

#[async_trait]
impl Evaluator for ProcessEvaluator {
    fn language_info(&self) -> LanguageInfo {
        self.language_info.clone()
    }

    async fn evaluate(
        &mut self,
        request: EvalRequest,
        host: &ExecutionHost,
    ) -> Result<EvalOutput, EvalError> {
        let id = self
            .send(&Request::Evaluate {
                code: &request.code,
                execution_count: request.execution_count,
                store_history: request.store_history,
            })
            .await?;
        self.running = Some(id);

        let outcome = self.run_evaluation(id, host).await;
        self.running = None;
        outcome
    }

    async fn configure(&mut self, setup: CompilationSetup) -> Result<Vec<PathBuf>, EvalError> {
        self.call(&Request::Configure {
            repositories: &setup.repositories,
            dependencies: &setup.dependencies,
            compiler_arguments: &setup.compiler_arguments,
            classpath: &setup.classpath,
        })
        .await
    }

    async fn complete(&mut self, code: &str, cursor: usize) -> Result<CompleteReply, EvalError> {
        self.call(&Request::Complete {
            code,
            cursor_pos: cursor,
        })
        .await
    }

    async fn list_errors(&mut self, code: &str) -> Result<Vec<Diagnostic>, EvalError> {
        self.call(&Request::ListErrors { code }).await
    }

    async fn is_complete(&mut self, code: &str) -> Result<IsCompleteReply, EvalError> {
        self.call(&Request::IsComplete { code }).await
    }

    async fn inspect(
        &mut self,
        code: &str,
        cursor: usize,
        detail_level: u8,
    ) -> Result<InspectReply, EvalError> {
        self.call(&Request::Inspect {
            code,
            cursor_pos: cursor,
            detail_level,
        })
        .await
    }

    async fn abort(&mut self) -> Result<(), EvalError> {
        match self.running.take() {
            Some(id) => {
                debug!(id, "interrupting abandoned evaluation");
                self.write(id, &Request::Interrupt).await
            }
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self) -> Result<(), EvalError> {
        let answered = time::timeout(SHUTDOWN_TIMEOUT, self.call::<Value>(&Request::Shutdown)).await;
        if !matches!(answered, Ok(Ok(_))) {
            warn!("evaluator did not acknowledge shutdown, killing it");
        }

        self.child.kill().await.map_err(process_failure)
    }
}
