use std::path::PathBuf;

use async_trait::async_trait;
use jotter_libraries::ResolutionError;
use jotter_protocol::content::{
    CodeCompleteness, CompleteReply, Diagnostic, DisplayData, ErrorContent, InspectReply,
    IsCompleteReply, LanguageInfo, ReplyStatus,
};
use serde_json::Map;
use thiserror::Error;

use crate::host::ExecutionHost;

pub const INTERRUPTED_ENAME: &str = "InterruptedException";

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("{ename}: {evalue}")]
    Failed {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    #[error("execution was interrupted")]
    Interrupted,
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("evaluator process failed: {0}")]
    Process(String),
}

impl EvalError {
    pub fn failed(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        EvalError::Failed {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: Vec::new(),
        }
    }

    /// What the frontend sees in the `error` broadcast and the execute reply.
    pub fn to_content(&self) -> ErrorContent {
        let (ename, evalue, traceback) = match self {
            EvalError::Failed {
                ename,
                evalue,
                traceback,
            } => (ename.clone(), evalue.clone(), traceback.clone()),
            EvalError::Interrupted => (
                INTERRUPTED_ENAME.to_string(),
                "The execution was interrupted".to_string(),
                Vec::new(),
            ),
            EvalError::Resolution(e) => ("ResolutionError".to_string(), e.to_string(), Vec::new()),
            EvalError::Process(reason) => ("EvaluatorError".to_string(), reason.clone(), Vec::new()),
        };

        let traceback = if traceback.is_empty() {
            vec![format!("{ename}: {evalue}")]
        } else {
            traceback
        };

        ErrorContent {
            ename,
            evalue,
            traceback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalRequest {
    pub code: String,
    pub execution_count: u32,
    pub store_history: bool,
    pub silent: bool,
}

/// The value of the last expression, if it has one worth displaying.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalOutput {
    pub result: Option<DisplayData>,
}

impl EvalOutput {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            result: Some(DisplayData::plain(text)),
        }
    }
}

/// Everything the session has accumulated that affects compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationSetup {
    pub repositories: Vec<String>,
    pub dependencies: Vec<String>,
    pub compiler_arguments: Vec<String>,
    pub classpath: Vec<PathBuf>,
}

/// The language backend driven by the kernel.
///
/// Only `language_info` and `evaluate` are mandatory. Evaluation is expected
/// to watch [`ExecutionHost::interrupted`] and return
/// [`EvalError::Interrupted`] once it fires.
#[async_trait]
pub trait Evaluator: Send {
    fn language_info(&self) -> LanguageInfo;

    fn banner(&self) -> String {
        let info = self.language_info();
        format!("{} {}", info.name, info.version)
    }

    async fn evaluate(
        &mut self,
        request: EvalRequest,
        host: &ExecutionHost,
    ) -> Result<EvalOutput, EvalError>;

    /// Returns the classpath entries added by `setup`.
    async fn configure(&mut self, _setup: CompilationSetup) -> Result<Vec<PathBuf>, EvalError> {
        Ok(Vec::new())
    }

    async fn complete(&mut self, _code: &str, cursor: usize) -> Result<CompleteReply, EvalError> {
        Ok(CompleteReply {
            status: ReplyStatus::Ok,
            matches: Vec::new(),
            cursor_start: cursor,
            cursor_end: cursor,
            metadata: Map::new(),
        })
    }

    async fn list_errors(&mut self, _code: &str) -> Result<Vec<Diagnostic>, EvalError> {
        Ok(Vec::new())
    }

    async fn is_complete(&mut self, _code: &str) -> Result<IsCompleteReply, EvalError> {
        Ok(IsCompleteReply {
            status: CodeCompleteness::Unknown,
            indent: None,
        })
    }

    async fn inspect(
        &mut self,
        _code: &str,
        _cursor: usize,
        _detail_level: u8,
    ) -> Result<InspectReply, EvalError> {
        Ok(InspectReply {
            status: ReplyStatus::Ok,
            found: false,
            data: Map::new(),
            metadata: Map::new(),
        })
    }

    /// Called when the session stopped waiting for an evaluation that is
    /// still running in the backend.
    async fn abort(&mut self) -> Result<(), EvalError> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), EvalError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[googletest::test]
    fn interrupts_are_reported_as_interrupted_exception() {
        let content = EvalError::Interrupted.to_content();

        expect_that!(content.ename, eq(INTERRUPTED_ENAME));
        expect_that!(content.traceback, not(empty()));
    }

    #[googletest::test]
    fn evaluator_tracebacks_are_kept() {
        let error = EvalError::Failed {
            ename: "CompilationException".to_string(),
            evalue: "unresolved reference: y".to_string(),
            traceback: vec!["line 1".to_string()],
        };

        expect_that!(error.to_content().traceback, elements_are![eq("line 1")]);
    }

    #[googletest::test]
    fn resolution_failures_carry_the_resolver_message() {
        let error = EvalError::from(ResolutionError::NotFound("kandy.json".to_string()));

        expect_that!(error.to_content().evalue, contains_substring("kandy.json"));
    }
}
