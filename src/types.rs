use serde::{Deserialize, Serialize};

/// A message in the conversation history sent to the completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// A single typed on-page action extracted from assistant or user text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    ClickByText {
        text: String,
    },
    HighlightByText {
        text: String,
    },
    ClickByXPath {
        xpath: String,
    },
    HighlightByXPath {
        xpath: String,
    },
    Retrieve {
        query: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        document_id: Option<String>,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::ClickByText { .. } | Action::ClickByXPath { .. } => ActionKind::Click,
            Action::HighlightByText { .. } | Action::HighlightByXPath { .. } => {
                ActionKind::Highlight
            }
            Action::Retrieve { .. } => ActionKind::Retrieve,
        }
    }

    /// The human-visible target (or query) this action refers to.
    pub fn target(&self) -> &str {
        match self {
            Action::ClickByText { text } | Action::HighlightByText { text } => text,
            Action::ClickByXPath { xpath } | Action::HighlightByXPath { xpath } => xpath,
            Action::Retrieve { query, .. } => query,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Click,
    Highlight,
    Retrieve,
}

/// One result chunk from the retrieval backend. The backend owns this shape;
/// we only read it. Some deployments send `content`, older ones `text`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl RetrievalChunk {
    pub fn body(&self) -> &str {
        self.content
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.text.as_deref())
            .unwrap_or("")
    }
}

/// Bounded context-augmented follow-up rounds per user turn.
pub const MAX_FOLLOW_UP_ROUNDS: usize = 3;
/// How many chunks to request when a retrieve action doesn't name a limit.
pub const RETRIEVAL_FETCH_LIMIT: usize = 8;
/// Chunks shown in the user-visible summary block.
pub const RETRIEVAL_DISPLAY_LIMIT: usize = 5;
/// Chunks carried in the machine-readable context block.
pub const RETRIEVAL_CONTEXT_LIMIT: usize = 8;
/// Per-chunk text cap in the summary block.
pub const SNIPPET_MAX_CHARS: usize = 280;
/// Cap on the sanitized page HTML sent with completion requests.
pub const PAGE_HTML_MAX_CHARS: usize = 16_000;
