use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use jotter_libraries::{
    parse_cell, CellSetup, LibraryResolver, ResolutionError, ResolutionInfoProvider,
};
use jotter_protocol::{
    content::{
        CodeCompleteness, CompleteReply, Diagnostic, ExecuteInput, ExecuteReply, ExecuteRequest,
        ExecuteResult, HistoryAccess, HistoryRequest, InspectReply, IsCompleteReply,
        KernelInfoReply, ReplyStatus, Severity,
    },
    PROTOCOL_VERSION,
};
use serde_json::Map;
use tokio::time;
use tracing::{debug, info, warn};

use crate::{
    config::InterruptPolicy,
    evaluator::{CompilationSetup, EvalError, EvalOutput, EvalRequest, Evaluator},
    host::ExecutionHost,
};

pub const IMPLEMENTATION: &str = "jotter";

/// How long the evaluator gets to acknowledge an abort.
pub const ABORT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub session: u32,
    pub line: u32,
    pub input: String,
}

/// The persistent state behind a notebook: execution counter, history,
/// everything libraries added so far, and the evaluator itself.
pub struct ExecutionSession {
    evaluator: Box<dyn Evaluator>,
    resolver: LibraryResolver,
    interrupt_policy: InterruptPolicy,
    execution_count: u32,
    history: Vec<HistoryEntry>,
    repositories: Vec<String>,
    compiler_arguments: Vec<String>,
    classpath: Vec<PathBuf>,
    shutdown_code: Vec<String>,
}

impl ExecutionSession {
    pub fn new(evaluator: Box<dyn Evaluator>, resolver: LibraryResolver) -> Self {
        Self {
            evaluator,
            resolver,
            interrupt_policy: InterruptPolicy::default(),
            execution_count: 0,
            history: Vec::new(),
            repositories: Vec::new(),
            compiler_arguments: Vec::new(),
            classpath: Vec::new(),
            shutdown_code: Vec::new(),
        }
    }

    pub fn with_interrupt_policy(mut self, policy: InterruptPolicy) -> Self {
        self.interrupt_policy = policy;
        self
    }

    pub fn with_classpath(mut self, classpath: Vec<PathBuf>) -> Self {
        self.classpath = classpath;
        self
    }

    pub fn execution_count(&self) -> u32 {
        self.execution_count
    }

    pub fn classpath(&self) -> &[PathBuf] {
        &self.classpath
    }

    pub fn resolution_provider(&self) -> Arc<ResolutionInfoProvider> {
        self.resolver.provider()
    }

    pub fn kernel_info(&self) -> KernelInfoReply {
        KernelInfoReply {
            status: ReplyStatus::Ok,
            protocol_version: PROTOCOL_VERSION.to_string(),
            implementation: IMPLEMENTATION.to_string(),
            implementation_version: env!("CARGO_PKG_VERSION").to_string(),
            language_info: self.evaluator.language_info(),
            banner: self.evaluator.banner(),
            help_links: Vec::new(),
        }
    }

    /// Runs one cell: directives first, then whatever code is left.
    ///
    /// The counter moves before anything else happens, so a failing cell still
    /// consumes its number.
    pub async fn execute(&mut self, request: &ExecuteRequest, host: &ExecutionHost) -> ExecuteReply {
        let store_history = request.store_history && !request.silent;
        if store_history {
            self.execution_count += 1;
        }
        let count = self.execution_count;

        if !request.silent {
            host.publish(ExecuteInput {
                code: request.code.clone(),
                execution_count: count,
            });
        }
        if store_history {
            self.history.push(HistoryEntry {
                session: 0,
                line: count,
                input: request.code.clone(),
            });
        }

        match self.run(request, count, host).await {
            Ok(output) => {
                if let Some(result) = output.result.filter(|_| !request.silent) {
                    host.publish(ExecuteResult {
                        execution_count: count,
                        data: result.data,
                        metadata: result.metadata,
                    });
                }
                ExecuteReply::ok(count)
            }
            Err(e) => {
                debug!(error = %e, execution_count = count, "cell failed");
                let content = e.to_content();
                host.publish(content.clone());
                ExecuteReply::error(count, &content)
            }
        }
    }

    async fn run(
        &mut self,
        request: &ExecuteRequest,
        count: u32,
        host: &ExecutionHost,
    ) -> Result<EvalOutput, EvalError> {
        let cell = parse_cell(&request.code)?;

        if !cell.directives.is_empty() {
            let setup = self.resolver.prepare(&cell.directives).await?;
            self.apply(setup, count, host).await?;
        }

        if !cell.has_code() {
            return Ok(EvalOutput::none());
        }

        self.evaluate(
            EvalRequest {
                code: cell.code,
                execution_count: count,
                store_history: request.store_history,
                silent: request.silent,
            },
            host,
        )
        .await
    }

    /// Commits a resolved setup: configure first, then library init code.
    async fn apply(&mut self, setup: CellSetup, count: u32, host: &ExecutionHost) -> Result<(), EvalError> {
        let mut repositories = self.repositories.clone();
        for repository in &setup.repositories {
            push_unique(&mut repositories, repository);
        }
        let mut compiler_arguments = self.compiler_arguments.clone();
        for argument in &setup.compiler_arguments {
            push_unique(&mut compiler_arguments, argument);
        }

        if setup.needs_configuration() {
            let added = self
                .evaluator
                .configure(CompilationSetup {
                    repositories: repositories.clone(),
                    dependencies: setup.dependencies.clone(),
                    compiler_arguments: compiler_arguments.clone(),
                    classpath: self.classpath.clone(),
                })
                .await?;

            self.repositories = repositories;
            self.compiler_arguments = compiler_arguments;
            for entry in added {
                if !self.classpath.contains(&entry) {
                    self.classpath.push(entry);
                }
            }
        }

        if !setup.libraries.is_empty() {
            info!(libraries = ?setup.libraries, "loading libraries");
        }

        for code in setup.init_code {
            self.evaluate(
                EvalRequest {
                    code,
                    execution_count: count,
                    store_history: false,
                    silent: true,
                },
                host,
            )
            .await?;
        }

        self.shutdown_code.extend(setup.shutdown_code);
        Ok(())
    }

    async fn evaluate(&mut self, request: EvalRequest, host: &ExecutionHost) -> Result<EvalOutput, EvalError> {
        match self.interrupt_policy {
            InterruptPolicy::Cooperative => self.evaluator.evaluate(request, host).await,
            InterruptPolicy::Abandon => {
                let sigint = host.interrupted().clone();
                let output = tokio::select! {
                    biased;
                    _ = sigint.cancelled() => None,
                    output = self.evaluator.evaluate(request, host) => Some(output),
                };
                match output {
                    Some(output) => output,
                    None => {
                        self.abort().await;
                        Err(EvalError::Interrupted)
                    }
                }
            }
        }
    }

    /// Tells the evaluator to drop whatever it is still running for us.
    pub async fn abort(&mut self) {
        match time::timeout(ABORT_TIMEOUT, self.evaluator.abort()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "evaluator could not abort"),
            Err(_) => warn!("evaluator did not accept the abort in time"),
        }
    }

    pub async fn complete(&mut self, code: &str, cursor: usize) -> CompleteReply {
        let empty = CompleteReply {
            status: ReplyStatus::Ok,
            matches: Vec::new(),
            cursor_start: cursor,
            cursor_end: cursor,
            metadata: Map::new(),
        };

        let Ok(masked) = mask_directives(code) else {
            return empty;
        };

        self.evaluator
            .complete(&masked, cursor)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "completion failed");
                empty
            })
    }

    pub async fn inspect(&mut self, code: &str, cursor: usize, detail_level: u8) -> InspectReply {
        let not_found = InspectReply {
            status: ReplyStatus::Ok,
            found: false,
            data: Map::new(),
            metadata: Map::new(),
        };

        let Ok(masked) = mask_directives(code) else {
            return not_found;
        };

        self.evaluator
            .inspect(&masked, cursor, detail_level)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "inspection failed");
                not_found
            })
    }

    pub async fn is_complete(&mut self, code: &str) -> IsCompleteReply {
        let cell = match parse_cell(code) {
            Ok(cell) => cell,
            Err(e) => {
                debug!(error = %e, "cell has invalid directives");
                return IsCompleteReply {
                    status: CodeCompleteness::Invalid,
                    indent: None,
                };
            }
        };

        if !cell.has_code() {
            return IsCompleteReply {
                status: CodeCompleteness::Complete,
                indent: None,
            };
        }

        self.evaluator
            .is_complete(&cell.code)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "completeness check failed");
                IsCompleteReply {
                    status: CodeCompleteness::Unknown,
                    indent: None,
                }
            })
    }

    pub async fn list_errors(&mut self, code: &str) -> Vec<Diagnostic> {
        let masked = match mask_directives(code) {
            Ok(masked) => masked,
            Err(e) => {
                return vec![Diagnostic {
                    message: e.to_string(),
                    severity: Severity::Error,
                    start: None,
                    end: None,
                }]
            }
        };

        self.evaluator.list_errors(&masked).await.unwrap_or_else(|e| {
            warn!(error = %e, "listing errors failed");
            Vec::new()
        })
    }

    pub fn history(&self, request: &HistoryRequest) -> Vec<(u32, u32, String)> {
        select_history(&self.history, request)
            .into_iter()
            .map(|entry| (entry.session, entry.line, entry.input.clone()))
            .collect()
    }

    /// Runs library shutdown code, then the evaluator's own shutdown hook.
    /// Each step gets at most `grace`; failures are logged and shutdown
    /// always proceeds.
    pub async fn shutdown(&mut self, host: &ExecutionHost, grace: Duration) {
        if time::timeout(grace, self.run_shutdown_code(host)).await.is_err() {
            warn!(?grace, "library shutdown code did not finish in time");
            self.abort().await;
        }

        match time::timeout(grace, self.evaluator.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "evaluator shutdown failed"),
            Err(_) => warn!(?grace, "evaluator did not shut down in time"),
        }
    }

    async fn run_shutdown_code(&mut self, host: &ExecutionHost) {
        let count = self.execution_count;

        for code in std::mem::take(&mut self.shutdown_code) {
            let request = EvalRequest {
                code,
                execution_count: count,
                store_history: false,
                silent: true,
            };
            if let Err(e) = self.evaluate(request, host).await {
                warn!(error = %e, "library shutdown code failed");
            }
        }
    }
}

fn push_unique(items: &mut Vec<String>, item: &str) {
    if !items.iter().any(|existing| existing == item) {
        items.push(item.to_string());
    }
}

/// Replaces directive lines with spaces of the same width, keeping cursor
/// offsets valid for the evaluator.
fn mask_directives(code: &str) -> Result<String, ResolutionError> {
    let cell = parse_cell(code)?;

    let mut masked = code
        .lines()
        .zip(cell.code.split('\n'))
        .map(|(original, kept)| {
            if original == kept {
                original.to_string()
            } else {
                " ".repeat(original.chars().count())
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    if code.ends_with('\n') {
        masked.push('\n');
    }

    Ok(masked)
}

fn select_history<'a>(entries: &'a [HistoryEntry], request: &HistoryRequest) -> Vec<&'a HistoryEntry> {
    let last = |selected: Vec<&'a HistoryEntry>, n: Option<usize>| match n {
        Some(n) => selected[selected.len().saturating_sub(n)..].to_vec(),
        None => selected,
    };

    match request.hist_access_type {
        HistoryAccess::Tail => last(entries.iter().collect(), request.n),
        HistoryAccess::Range => {
            let start = request.start.unwrap_or(0);
            let stop = request.stop.unwrap_or(i64::MAX);
            entries
                .iter()
                .filter(|entry| (start..stop).contains(&i64::from(entry.line)))
                .collect()
        }
        HistoryAccess::Search => {
            let pattern = request.pattern.as_deref().unwrap_or("*");
            let mut found: Vec<&HistoryEntry> = entries
                .iter()
                .filter(|entry| matches_pattern(&entry.input, pattern))
                .collect();

            if request.unique {
                let mut seen = HashSet::new();
                found.reverse();
                found.retain(|entry| seen.insert(entry.input.as_str()));
                found.reverse();
            }

            last(found, request.n)
        }
    }
}

/// `*` matches any run of characters; a pattern without `*` matches substrings.
fn matches_pattern(input: &str, pattern: &str) -> bool {
    let mut rest = input;

    for part in pattern.split('*').filter(|part| !part.is_empty()) {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    fn entries() -> Vec<HistoryEntry> {
        ["val a = 1", "print(a)", "val b = 2", "print(a)", "a + b"]
            .iter()
            .enumerate()
            .map(|(i, input)| HistoryEntry {
                session: 0,
                line: i as u32 + 1,
                input: input.to_string(),
            })
            .collect()
    }

    fn lines(selected: Vec<&HistoryEntry>) -> Vec<u32> {
        selected.into_iter().map(|entry| entry.line).collect()
    }

    #[googletest::test]
    fn tail_returns_the_last_entries() {
        let request = HistoryRequest {
            n: Some(2),
            ..HistoryRequest::default()
        };

        expect_that!(lines(select_history(&entries(), &request)), elements_are![eq(4), eq(5)]);
    }

    #[googletest::test]
    fn range_is_half_open() {
        let request = HistoryRequest {
            hist_access_type: HistoryAccess::Range,
            start: Some(2),
            stop: Some(4),
            ..HistoryRequest::default()
        };

        expect_that!(lines(select_history(&entries(), &request)), elements_are![eq(2), eq(3)]);
    }

    #[googletest::test]
    fn search_matches_patterns_and_collapses_duplicates() {
        let request = HistoryRequest {
            hist_access_type: HistoryAccess::Search,
            pattern: Some("print*".to_string()),
            unique: true,
            ..HistoryRequest::default()
        };

        expect_that!(lines(select_history(&entries(), &request)), elements_are![eq(4)]);

        let request = HistoryRequest {
            hist_access_type: HistoryAccess::Search,
            pattern: Some("val".to_string()),
            ..HistoryRequest::default()
        };
        expect_that!(lines(select_history(&entries(), &request)), elements_are![eq(1), eq(3)]);
    }

    #[googletest::test]
    fn directives_are_masked_without_moving_offsets() {
        let code = "%use lib\nval x = 1\n";

        let masked = mask_directives(code).unwrap();

        expect_that!(masked, eq("        \nval x = 1\n"));
        expect_that!(masked.len(), eq(code.len()));
    }
}
