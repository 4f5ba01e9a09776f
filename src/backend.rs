//! HTTP clients for the two external collaborators: the chat completion
//! backend and the document retrieval backend. Both sit behind traits so the
//! orchestrator can be exercised against fakes.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::error::BackendError;
use crate::types::{ChatMessage, RetrievalChunk};

/// One completion round trip. `page_html` and `rag_context` ride along as
/// extra grounding when present.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub model: &'a str,
    #[serde(rename = "pageHtml", skip_serializing_if = "Option::is_none")]
    pub page_html: Option<&'a str>,
    #[serde(rename = "ragContext", skip_serializing_if = "Option::is_none")]
    pub rag_context: Option<&'a str>,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Returns the assistant reply text. The caller treats it as opaque text
    /// for the directive parser.
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String, BackendError>;
}

#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        document_id: Option<&str>,
    ) -> Result<Vec<RetrievalChunk>, BackendError>;
}

pub struct HttpCompletionClient {
    client: Client,
    endpoint: String,
}

impl HttpCompletionClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String, BackendError> {
        debug!(endpoint = %self.endpoint, messages = request.messages.len(), "completion call");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let message = body["error"]
                .as_str()
                .unwrap_or("unknown backend error")
                .to_string();
            return Err(BackendError::Status { status, message });
        }

        body["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::InvalidResponse(body.to_string()))
    }
}

pub struct HttpRetrievalClient {
    client: Client,
    base_url: String,
    tenant_id: String,
}

impl HttpRetrievalClient {
    pub fn new(base_url: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

#[async_trait]
impl RetrievalBackend for HttpRetrievalClient {
    async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        document_id: Option<&str>,
    ) -> Result<Vec<RetrievalChunk>, BackendError> {
        let url = format!(
            "{}/tenants/{}/retrieval",
            self.base_url.trim_end_matches('/'),
            self.tenant_id
        );
        debug!(%url, query, limit, "retrieval call");

        let mut request = self
            .client
            .get(&url)
            .query(&[("query", query), ("limit", &limit.to_string())]);
        if let Some(document_id) = document_id {
            request = request.query(&[("document_id", document_id)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, message });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatRole;

    #[test]
    fn completion_request_omits_absent_grounding() {
        let messages = vec![ChatMessage::new(ChatRole::User, "hi")];
        let request = CompletionRequest {
            messages: &messages,
            model: "solar-pro2",
            page_html: None,
            rag_context: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("pageHtml").is_none());
        assert!(value.get("ragContext").is_none());
        assert_eq!(value["model"], "solar-pro2");
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn completion_request_carries_grounding_when_present() {
        let messages = vec![ChatMessage::new(ChatRole::User, "hi")];
        let request = CompletionRequest {
            messages: &messages,
            model: "solar-pro2",
            page_html: Some("<body></body>"),
            rag_context: Some("RAG_CONTEXT Query: x"),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["pageHtml"], "<body></body>");
        assert_eq!(value["ragContext"], "RAG_CONTEXT Query: x");
    }

    #[test]
    fn chunk_body_prefers_content_over_text() {
        let chunk: RetrievalChunk = serde_json::from_value(serde_json::json!({
            "document_id": "doc-1",
            "content": "from content",
            "text": "from text",
            "score": 0.5
        }))
        .unwrap();
        assert_eq!(chunk.body(), "from content");

        let chunk: RetrievalChunk =
            serde_json::from_value(serde_json::json!({ "text": "only text" })).unwrap();
        assert_eq!(chunk.body(), "only text");
    }
}
