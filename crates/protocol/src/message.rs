use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::content::MessageContent;

pub const PROTOCOL_VERSION: &str = "5.3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub session: String,
    pub username: String,
    pub msg_type: String,
    pub version: String,
    #[serde(default)]
    pub date: String,
}

impl Header {
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            session: session.into(),
            username: username.into(),
            msg_type: msg_type.into(),
            version: PROTOCOL_VERSION.to_string(),
            date: now(),
        }
    }
}

fn now() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageData {
    pub header: Header,
    pub parent_header: Option<Header>,
    pub metadata: Map<String, Value>,
    pub content: MessageContent,
}

impl MessageData {
    pub fn new(content: MessageContent, session: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            header: Header::new(content.message_type(), session, username),
            parent_header: None,
            metadata: Map::new(),
            content,
        }
    }

    /// Builds a message caused by `parent`: same session and user, parent header set.
    pub fn caused_by(parent: &Header, content: MessageContent) -> Self {
        Self {
            header: Header::new(
                content.message_type(),
                parent.session.clone(),
                parent.username.clone(),
            ),
            parent_header: Some(parent.clone()),
            metadata: Map::new(),
            content,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn message_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }
}

/// A message together with its routing prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub identities: Vec<Bytes>,
    pub data: MessageData,
}

impl Message {
    pub fn new(identities: Vec<Bytes>, data: MessageData) -> Self {
        Self { identities, data }
    }

    /// Reply routed back to whoever sent `self`.
    pub fn reply(&self, content: MessageContent) -> Message {
        Message {
            identities: self.identities.clone(),
            data: MessageData::caused_by(&self.data.header, content),
        }
    }

    /// Broadcast for iopub; the topic frame is the message type.
    pub fn broadcast(parent: &Header, content: MessageContent) -> Message {
        let data = MessageData::caused_by(parent, content);
        Message {
            identities: vec![Bytes::from(data.header.msg_type.clone())],
            data,
        }
    }

    pub fn header(&self) -> &Header {
        &self.data.header
    }

    pub fn content(&self) -> &MessageContent {
        &self.data.content
    }

    pub fn message_type(&self) -> &str {
        self.data.message_type()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.data.parent_id()
    }
}
