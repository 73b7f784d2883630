use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use jotter_kernel::{
    evaluator::CompilationSetup, EvalError, EvalOutput, EvalRequest, Evaluator, ExecutionHost,
};
use jotter_protocol::content::{
    CodeCompleteness, CompleteReply, IsCompleteReply, LanguageInfo, ReplyStatus,
};
use serde_json::Map;
use tokio::time::sleep;

/// Everything the mock saw, for assertions after the kernel is gone.
#[derive(Debug, Default)]
pub struct Journal {
    pub evaluated: Vec<String>,
    pub configured: Vec<CompilationSetup>,
    pub aborted: u32,
    pub shut_down: bool,
}

/// A toy line-oriented language:
/// - `val NAME = VALUE` binds a variable
/// - `print("TEXT")` writes TEXT to stdout
/// - a bare number or variable name is the cell's result
/// - `import ...` is accepted and ignored
/// - any line containing `buggy` fails
/// - `expensive_op` prints partial output, then waits 10s unless interrupted
/// - `stubborn_op` waits 10s and ignores interrupts
/// - `input` asks the frontend for a value and prints it
pub struct MockEvaluator {
    variables: HashMap<String, String>,
    journal: Arc<Mutex<Journal>>,
}

impl MockEvaluator {
    pub fn new(journal: Arc<Mutex<Journal>>) -> Self {
        Self {
            variables: HashMap::new(),
            journal,
        }
    }

    async fn run_line(&mut self, line: &str, host: &ExecutionHost) -> Result<Option<String>, EvalError> {
        let line = line.trim();

        if line.is_empty() || line.starts_with("import ") {
            return Ok(None);
        }
        if line.contains("buggy") {
            host.stderr("Syntax error");
            return Err(EvalError::failed("SyntaxError", format!("cannot parse `{line}`")));
        }
        if line.contains("expensive_op") {
            host.stdout("Partial output...");
            tokio::select! {
                _ = sleep(Duration::from_secs(10)) => host.stdout("rest of output"),
                _ = host.interrupted().cancelled() => return Err(EvalError::Interrupted),
            }
            return Ok(None);
        }
        if line.contains("stubborn_op") {
            sleep(Duration::from_secs(10)).await;
            return Ok(None);
        }
        if line == "input" {
            let value = host.read_input("value: ", false).await?;
            host.stdout(value);
            return Ok(None);
        }
        if let Some(text) = line
            .strip_prefix("print(\"")
            .and_then(|rest| rest.strip_suffix("\")"))
        {
            host.stdout(text);
            return Ok(None);
        }
        if let Some(binding) = line.strip_prefix("val ") {
            let Some((name, value)) = binding.split_once('=') else {
                return Err(EvalError::failed("SyntaxError", "expected `=`"));
            };
            self.variables
                .insert(name.trim().to_string(), value.trim().to_string());
            return Ok(None);
        }
        if line.parse::<f64>().is_ok() {
            return Ok(Some(line.to_string()));
        }

        self.variables
            .get(line)
            .cloned()
            .map(Some)
            .ok_or_else(|| EvalError::failed("UnresolvedReference", format!("unresolved reference: {line}")))
    }
}

#[async_trait]
impl Evaluator for MockEvaluator {
    fn language_info(&self) -> LanguageInfo {
        LanguageInfo {
            name: "mock".to_string(),
            version: "1.0".to_string(),
            mimetype: "text/x-mock".to_string(),
            file_extension: ".mock".to_string(),
            pygments_lexer: None,
            codemirror_mode: None,
        }
    }

    async fn evaluate(&mut self, request: EvalRequest, host: &ExecutionHost) -> Result<EvalOutput, EvalError> {
        self.journal
            .lock()
            .unwrap()
            .evaluated
            .push(request.code.clone());

        let mut result = None;
        for line in request.code.lines() {
            result = self.run_line(line, host).await?;
        }

        Ok(match result {
            Some(text) => EvalOutput::plain(text),
            None => EvalOutput::none(),
        })
    }

    async fn configure(&mut self, setup: CompilationSetup) -> Result<Vec<PathBuf>, EvalError> {
        let added = setup
            .dependencies
            .iter()
            .map(|dependency| PathBuf::from(format!("{dependency}.jar")))
            .collect();
        self.journal.lock().unwrap().configured.push(setup);
        Ok(added)
    }

    async fn complete(&mut self, code: &str, cursor: usize) -> Result<CompleteReply, EvalError> {
        let prefix_start = code[..cursor]
            .rfind(|c: char| !c.is_alphanumeric())
            .map_or(0, |i| i + 1);
        let prefix = &code[prefix_start..cursor];

        let mut matches: Vec<String> = self
            .variables
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        matches.sort();

        Ok(CompleteReply {
            status: ReplyStatus::Ok,
            matches,
            cursor_start: prefix_start,
            cursor_end: cursor,
            metadata: Map::new(),
        })
    }

    async fn is_complete(&mut self, code: &str) -> Result<IsCompleteReply, EvalError> {
        let depth: i32 = code
            .chars()
            .map(|c| match c {
                '(' | '{' => 1,
                ')' | '}' => -1,
                _ => 0,
            })
            .sum();

        Ok(match depth {
            0 => IsCompleteReply {
                status: CodeCompleteness::Complete,
                indent: None,
            },
            d if d > 0 => IsCompleteReply {
                status: CodeCompleteness::Incomplete,
                indent: Some("    ".to_string()),
            },
            _ => IsCompleteReply {
                status: CodeCompleteness::Invalid,
                indent: None,
            },
        })
    }

    async fn abort(&mut self) -> Result<(), EvalError> {
        self.journal.lock().unwrap().aborted += 1;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), EvalError> {
        self.journal.lock().unwrap().shut_down = true;
        Ok(())
    }
}
