//! Content schemas of the messages the kernel sends and understands.
//!
//! Field names follow the Jupyter messaging protocol. Messages of a type not
//! listed here survive decoding as [`MessageContent::Other`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeCompleteness {
    Complete,
    Incomplete,
    Invalid,
    Unknown,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfoRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub name: String,
    pub version: String,
    pub mimetype: String,
    pub file_extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pygments_lexer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codemirror_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelpLink {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfoReply {
    pub status: ReplyStatus,
    pub protocol_version: String,
    pub implementation: String,
    pub implementation_version: String,
    pub language_info: LanguageInfo,
    #[serde(default)]
    pub banner: String,
    #[serde(default)]
    pub help_links: Vec<HelpLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "yes")]
    pub store_history: bool,
    #[serde(default)]
    pub user_expressions: Map<String, Value>,
    #[serde(default = "yes")]
    pub allow_stdin: bool,
    #[serde(default = "yes")]
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: Map::new(),
            allow_stdin: true,
            stop_on_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    pub execution_count: u32,
    #[serde(default)]
    pub user_expressions: Map<String, Value>,
    #[serde(default)]
    pub payload: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evalue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Vec<String>>,
}

impl ExecuteReply {
    pub fn ok(execution_count: u32) -> Self {
        Self::with_status(ReplyStatus::Ok, execution_count)
    }

    pub fn aborted(execution_count: u32) -> Self {
        Self::with_status(ReplyStatus::Aborted, execution_count)
    }

    pub fn error(execution_count: u32, error: &ErrorContent) -> Self {
        Self {
            ename: Some(error.ename.clone()),
            evalue: Some(error.evalue.clone()),
            traceback: Some(error.traceback.clone()),
            ..Self::with_status(ReplyStatus::Error, execution_count)
        }
    }

    fn with_status(status: ReplyStatus, execution_count: u32) -> Self {
        Self {
            status,
            execution_count,
            user_expressions: Map::new(),
            payload: Vec::new(),
            ename: None,
            evalue: None,
            traceback: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub code: String,
    pub execution_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub execution_count: u32,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A mime bundle, as carried by display_data and execute_result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayData {
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub transient: Map<String, Value>,
}

impl DisplayData {
    pub fn plain(text: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("text/plain".to_string(), Value::String(text.into()));
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn with_display_id(mut self, id: impl Into<String>) -> Self {
        self.transient
            .insert("display_id".to_string(), Value::String(id.into()));
        self
    }

    pub fn plain_text(&self) -> Option<&str> {
        self.data.get("text/plain").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateDisplayData {
    pub display: DisplayData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub name: StreamName,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub execution_state: ExecutionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub code: String,
    pub cursor_pos: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteReply {
    pub status: ReplyStatus,
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectRequest {
    pub code: String,
    pub cursor_pos: usize,
    #[serde(default)]
    pub detail_level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectReply {
    pub status: ReplyStatus,
    pub found: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsCompleteRequest {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsCompleteReply {
    pub status: CodeCompleteness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indent: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAccess {
    Range,
    #[default]
    Tail,
    Search,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub output: bool,
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub hist_access_type: HistoryAccess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryReply {
    pub status: ReplyStatus,
    /// `(session, line, input)` triples.
    pub history: Vec<(u32, u32, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommInfoRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommInfoReply {
    pub status: ReplyStatus,
    pub comms: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReply {
    pub status: ReplyStatus,
    pub restart: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptRequest {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptReply {
    pub status: ReplyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputReply {
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Position>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListErrorsRequest {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListErrorsReply {
    pub code: String,
    pub errors: Vec<Diagnostic>,
}

macro_rules! message_contents {
    ($($variant:ident($ty:ty) => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, PartialEq)]
        pub enum MessageContent {
            $($variant($ty),)*
            Other { msg_type: String, content: Value },
        }

        impl MessageContent {
            pub fn message_type(&self) -> &str {
                match self {
                    $(MessageContent::$variant(_) => $name,)*
                    MessageContent::Other { msg_type, .. } => msg_type,
                }
            }

            pub fn to_value(&self) -> Result<Value, serde_json::Error> {
                match self {
                    $(MessageContent::$variant(content) => serde_json::to_value(content),)*
                    MessageContent::Other { content, .. } => Ok(content.clone()),
                }
            }

            pub fn from_value(msg_type: &str, value: Value) -> Result<Self, serde_json::Error> {
                match msg_type {
                    $($name => serde_json::from_value(value).map(MessageContent::$variant),)*
                    _ => Ok(MessageContent::Other {
                        msg_type: msg_type.to_string(),
                        content: value,
                    }),
                }
            }
        }

        $(
            impl From<$ty> for MessageContent {
                fn from(content: $ty) -> Self {
                    MessageContent::$variant(content)
                }
            }
        )*
    };
}

message_contents! {
    KernelInfoRequest(KernelInfoRequest) => "kernel_info_request",
    KernelInfoReply(KernelInfoReply) => "kernel_info_reply",
    ExecuteRequest(ExecuteRequest) => "execute_request",
    ExecuteReply(ExecuteReply) => "execute_reply",
    ExecuteInput(ExecuteInput) => "execute_input",
    ExecuteResult(ExecuteResult) => "execute_result",
    DisplayData(DisplayData) => "display_data",
    UpdateDisplayData(UpdateDisplayData) => "update_display_data",
    Stream(Stream) => "stream",
    Error(ErrorContent) => "error",
    Status(Status) => "status",
    CompleteRequest(CompleteRequest) => "complete_request",
    CompleteReply(CompleteReply) => "complete_reply",
    InspectRequest(InspectRequest) => "inspect_request",
    InspectReply(InspectReply) => "inspect_reply",
    IsCompleteRequest(IsCompleteRequest) => "is_complete_request",
    IsCompleteReply(IsCompleteReply) => "is_complete_reply",
    HistoryRequest(HistoryRequest) => "history_request",
    HistoryReply(HistoryReply) => "history_reply",
    CommInfoRequest(CommInfoRequest) => "comm_info_request",
    CommInfoReply(CommInfoReply) => "comm_info_reply",
    ShutdownRequest(ShutdownRequest) => "shutdown_request",
    ShutdownReply(ShutdownReply) => "shutdown_reply",
    InterruptRequest(InterruptRequest) => "interrupt_request",
    InterruptReply(InterruptReply) => "interrupt_reply",
    InputRequest(InputRequest) => "input_request",
    InputReply(InputReply) => "input_reply",
    ListErrorsRequest(ListErrorsRequest) => "list_errors_request",
    ListErrorsReply(ListErrorsReply) => "list_errors_reply",
}

impl MessageContent {
    pub fn status(execution_state: ExecutionState) -> Self {
        MessageContent::Status(Status { execution_state })
    }

    pub fn stream(name: StreamName, text: impl Into<String>) -> Self {
        MessageContent::Stream(Stream {
            name,
            text: text.into(),
        })
    }
}
