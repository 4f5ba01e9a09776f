//! Maps typed actions to page effects. Never raises: every DOM failure is
//! folded into a `success: false` outcome, and retrieval failures become a
//! user-visible error summary.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::RetrievalBackend;
use crate::error::PageError;
use crate::page::{ElementSnapshot, PageDriver};
use crate::resolver;
use crate::spotlight::{flash_highlight, SpotlightManager};
use crate::types::{
    Action, ActionKind, RetrievalChunk, RETRIEVAL_CONTEXT_LIMIT, RETRIEVAL_DISPLAY_LIMIT,
    RETRIEVAL_FETCH_LIMIT, SNIPPET_MAX_CHARS,
};

/// What executing one action produced. `summary` is user-facing text to
/// append to the conversation; `context` feeds the next completion call.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub kind: ActionKind,
    pub success: bool,
    pub summary: Option<String>,
    pub context: Option<String>,
}

impl ExecutionOutcome {
    fn failed(kind: ActionKind) -> Self {
        Self {
            kind,
            success: false,
            summary: None,
            context: None,
        }
    }

    fn succeeded(kind: ActionKind) -> Self {
        Self {
            kind,
            success: true,
            summary: None,
            context: None,
        }
    }
}

pub struct ActionExecutor {
    driver: Arc<dyn PageDriver>,
    spotlight: Arc<SpotlightManager>,
    retrieval: Arc<dyn RetrievalBackend>,
}

impl ActionExecutor {
    pub fn new(
        driver: Arc<dyn PageDriver>,
        spotlight: Arc<SpotlightManager>,
        retrieval: Arc<dyn RetrievalBackend>,
    ) -> Self {
        Self {
            driver,
            spotlight,
            retrieval,
        }
    }

    pub async fn execute(&self, action: &Action) -> ExecutionOutcome {
        debug!(?action, "executing action");
        match action {
            Action::ClickByText { text } => {
                let found = resolver::resolve(self.driver.as_ref(), text).await;
                self.click_target(found).await
            }
            Action::ClickByXPath { xpath } => {
                let found = self.driver.find_by_xpath(xpath).await;
                self.click_target(found).await
            }
            Action::HighlightByText { text } => {
                let found = resolver::resolve(self.driver.as_ref(), text).await;
                self.highlight_target(found).await
            }
            Action::HighlightByXPath { xpath } => {
                let found = self.driver.find_by_xpath(xpath).await;
                self.highlight_target(found).await
            }
            Action::Retrieve {
                query,
                limit,
                document_id,
            } => self.retrieve(query, *limit, document_id.as_deref()).await,
        }
    }

    async fn click_target(
        &self,
        found: Result<Option<ElementSnapshot>, PageError>,
    ) -> ExecutionOutcome {
        let Ok(Some(el)) = found else {
            return ExecutionOutcome::failed(ActionKind::Click);
        };
        if self.driver.scroll_into_view(&el.id).await.is_err() {
            return ExecutionOutcome::failed(ActionKind::Click);
        }
        if flash_highlight(&self.driver, &el).await.is_err() {
            return ExecutionOutcome::failed(ActionKind::Click);
        }
        match self.driver.click(&el.id).await {
            Ok(()) => ExecutionOutcome::succeeded(ActionKind::Click),
            Err(e) => {
                warn!(element = %el.id, error = %e, "click failed");
                ExecutionOutcome::failed(ActionKind::Click)
            }
        }
    }

    async fn highlight_target(
        &self,
        found: Result<Option<ElementSnapshot>, PageError>,
    ) -> ExecutionOutcome {
        let Ok(Some(el)) = found else {
            return ExecutionOutcome::failed(ActionKind::Highlight);
        };
        if self.driver.scroll_into_view(&el.id).await.is_err() {
            return ExecutionOutcome::failed(ActionKind::Highlight);
        }
        match self.spotlight.activate(&el).await {
            Ok(()) => ExecutionOutcome::succeeded(ActionKind::Highlight),
            Err(e) => {
                warn!(element = %el.id, error = %e, "spotlight failed");
                ExecutionOutcome::failed(ActionKind::Highlight)
            }
        }
    }

    async fn retrieve(
        &self,
        query: &str,
        limit: Option<usize>,
        document_id: Option<&str>,
    ) -> ExecutionOutcome {
        let limit = limit.unwrap_or(RETRIEVAL_FETCH_LIMIT);
        match self.retrieval.retrieve(query, limit, document_id).await {
            Ok(chunks) => ExecutionOutcome {
                kind: ActionKind::Retrieve,
                success: true,
                summary: Some(format_retrieval_summary(query, &chunks)),
                context: Some(build_rag_context(query, &chunks)),
            },
            Err(e) => {
                warn!(query, error = %e, "retrieval failed");
                ExecutionOutcome {
                    kind: ActionKind::Retrieve,
                    success: false,
                    summary: Some(format!("⚠️ Retrieval failed: {e}")),
                    context: None,
                }
            }
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// User-facing summary block. The rendering layer folds the `RAG_BLOCK`
/// framing into a collapsible result list.
pub fn format_retrieval_summary(query: &str, chunks: &[RetrievalChunk]) -> String {
    let mut lines = vec![format!(
        "RAG_BLOCK_START Retrieved {} results for \"{}\"",
        chunks.len(),
        query
    )];
    for (i, chunk) in chunks.iter().take(RETRIEVAL_DISPLAY_LIMIT).enumerate() {
        let text = truncate_chars(&collapse_whitespace(chunk.body()), SNIPPET_MAX_CHARS);
        let doc = chunk
            .document_id
            .as_deref()
            .map(|d| format!(" doc:{d}"))
            .unwrap_or_default();
        let score = chunk
            .score
            .map(|s| format!(" score:{s:.3}"))
            .unwrap_or_default();
        lines.push(format!("- [{}]{doc}{score} {text}", i + 1));
    }
    lines.push("RAG_BLOCK_END".to_string());
    lines.push(String::new());
    lines.push("ACTION NOTE Retrieved context loaded.".to_string());
    lines.join("\n")
}

/// Machine-oriented context block injected into the follow-up completion
/// request. Untruncated text, wider result window than the summary.
pub fn build_rag_context(query: &str, chunks: &[RetrievalChunk]) -> String {
    let mut parts = vec![format!("RAG_CONTEXT Query: {query}")];
    for (i, chunk) in chunks.iter().take(RETRIEVAL_CONTEXT_LIMIT).enumerate() {
        let doc = chunk.document_id.as_deref().unwrap_or("");
        let score = chunk.score.map(|s| format!("{s:.4}")).unwrap_or_default();
        parts.push(format!("[{}] doc:{doc} score:{score}", i + 1));
        parts.push(collapse_whitespace(chunk.body()));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::OverlayKind;
    use crate::testing::{chunk, visible_element, FakePage, ScriptedRetrieval};
    use crate::types::Action;

    fn executor_with(
        page: Arc<FakePage>,
        retrieval: Arc<ScriptedRetrieval>,
    ) -> (ActionExecutor, Arc<SpotlightManager>) {
        let spotlight = Arc::new(SpotlightManager::new(page.clone()));
        (
            ActionExecutor::new(page, spotlight.clone(), retrieval),
            spotlight,
        )
    }

    #[tokio::test]
    async fn click_scrolls_flashes_and_clicks() {
        let page = Arc::new(FakePage::new(vec![visible_element(
            "go",
            "button",
            "Start Building",
        )]));
        let (executor, _) = executor_with(page.clone(), Arc::new(ScriptedRetrieval::empty()));

        let outcome = executor
            .execute(&Action::ClickByText {
                text: "Start Building".into(),
            })
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.kind, ActionKind::Click);
        assert_eq!(page.scrolled_ids(), vec!["go".to_string()]);
        assert_eq!(page.clicked_ids(), vec!["go".to_string()]);
        assert_eq!(page.overlay_kinds(), vec![OverlayKind::Flash]);
    }

    #[tokio::test]
    async fn unresolved_click_fails_without_side_effects() {
        let page = Arc::new(FakePage::new(vec![]));
        let (executor, _) = executor_with(page.clone(), Arc::new(ScriptedRetrieval::empty()));

        let outcome = executor
            .execute(&Action::ClickByText {
                text: "Nope".into(),
            })
            .await;

        assert!(!outcome.success);
        assert!(page.clicked_ids().is_empty());
        assert_eq!(page.overlay_count(), 0);
    }

    #[tokio::test]
    async fn throwing_click_reports_failure() {
        let page = Arc::new(FakePage::new(vec![visible_element("go", "button", "Go")]));
        page.fail_clicks_on("go");
        let (executor, _) = executor_with(page.clone(), Arc::new(ScriptedRetrieval::empty()));

        let outcome = executor
            .execute(&Action::ClickByText { text: "Go".into() })
            .await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn highlight_activates_spotlight() {
        let page = Arc::new(FakePage::new(vec![visible_element(
            "agent",
            "a",
            "Austin, TX",
        )]));
        let (executor, spotlight) = executor_with(page.clone(), Arc::new(ScriptedRetrieval::empty()));

        let outcome = executor
            .execute(&Action::HighlightByText {
                text: "Austin, TX".into(),
            })
            .await;

        assert!(outcome.success);
        assert!(spotlight.is_active().await);
        assert_eq!(page.overlay_kinds(), vec![OverlayKind::Spotlight]);
        assert_eq!(page.scrolled_ids(), vec!["agent".to_string()]);
        spotlight.clear().await;
    }

    #[tokio::test]
    async fn xpath_highlight_uses_driver_lookup() {
        let page = Arc::new(FakePage::new(vec![]));
        page.register_xpath("//div[@id='hero']", visible_element("hero", "div", "Hero"));
        let (executor, spotlight) = executor_with(page.clone(), Arc::new(ScriptedRetrieval::empty()));

        let outcome = executor
            .execute(&Action::HighlightByXPath {
                xpath: "//div[@id='hero']".into(),
            })
            .await;
        assert!(outcome.success);
        spotlight.clear().await;
    }

    #[tokio::test]
    async fn retrieve_formats_summary_and_context() {
        let page = Arc::new(FakePage::new(vec![]));
        let retrieval = Arc::new(ScriptedRetrieval::with_chunks(vec![
            chunk("doc-1", "Coverage includes water damage.", 0.91),
            chunk("doc-2", "Claims are filed online.", 0.82),
            chunk("doc-3", "Cancellation takes 30 days.", 0.77),
        ]));
        let (executor, _) = executor_with(page, retrieval.clone());

        let outcome = executor
            .execute(&Action::Retrieve {
                query: "cancellation policy".into(),
                limit: None,
                document_id: None,
            })
            .await;

        assert!(outcome.success);
        let summary = outcome.summary.unwrap();
        assert!(summary.starts_with("RAG_BLOCK_START Retrieved 3 results for \"cancellation policy\""));
        assert_eq!(summary.matches("\n- [").count(), 3);
        assert!(summary.contains("RAG_BLOCK_END"));
        assert!(summary.contains("doc:doc-1 score:0.910"));

        let context = outcome.context.unwrap();
        assert!(context.starts_with("RAG_CONTEXT Query: cancellation policy"));
        assert!(context.contains("[1] doc:doc-1 score:0.9100"));
        assert!(context.contains("Cancellation takes 30 days."));

        assert_eq!(retrieval.requested_limits(), vec![RETRIEVAL_FETCH_LIMIT]);
    }

    #[tokio::test]
    async fn summary_truncates_and_bounds_results() {
        let long_text = "word ".repeat(200);
        let chunks: Vec<_> = (0..7)
            .map(|i| chunk(&format!("doc-{i}"), &long_text, 0.5))
            .collect();
        let summary = format_retrieval_summary("q", &chunks);
        assert!(summary.contains("Retrieved 7 results"));
        assert_eq!(summary.matches("\n- [").count(), RETRIEVAL_DISPLAY_LIMIT);
        for line in summary.lines().filter(|l| l.starts_with("- [")) {
            // header tokens plus the 280-char snippet
            assert!(line.chars().count() < SNIPPET_MAX_CHARS + 40);
        }
        let context = build_rag_context("q", &chunks);
        assert_eq!(context.matches("\n[").count(), 7.min(RETRIEVAL_CONTEXT_LIMIT));
    }

    #[tokio::test]
    async fn failed_retrieval_reports_error_summary() {
        let page = Arc::new(FakePage::new(vec![]));
        let retrieval = Arc::new(ScriptedRetrieval::failing());
        let (executor, _) = executor_with(page, retrieval);

        let outcome = executor
            .execute(&Action::Retrieve {
                query: "anything".into(),
                limit: None,
                document_id: None,
            })
            .await;

        assert!(!outcome.success);
        assert!(outcome.summary.unwrap().starts_with("⚠️ Retrieval failed:"));
        assert!(outcome.context.is_none());
    }
}
