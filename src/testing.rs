//! In-crate test doubles: a scripted page driver and counting backends.

use std::collections::{HashMap, HashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::backend::{CompletionBackend, CompletionRequest, RetrievalBackend};
use crate::error::{BackendError, PageError};
use crate::page::{
    ElementId, ElementSnapshot, OverlayFrame, OverlayId, OverlayKind, PageDriver, PageEvent, Rect,
};
use crate::types::RetrievalChunk;

pub fn visible_element(id: &str, tag: &str, text: &str) -> ElementSnapshot {
    ElementSnapshot {
        id: ElementId(id.to_string()),
        tag: tag.to_string(),
        rect: Rect::new(10.0, 10.0, 120.0, 40.0),
        display: "block".to_string(),
        visibility: "visible".to_string(),
        opacity: "1".to_string(),
        text_content: text.to_string(),
        ..Default::default()
    }
}

pub fn chunk(document_id: &str, text: &str, score: f64) -> RetrievalChunk {
    RetrievalChunk {
        document_id: Some(document_id.to_string()),
        content: Some(text.to_string()),
        score: Some(score),
        ..Default::default()
    }
}

struct OverlayEntry {
    id: OverlayId,
    kind: OverlayKind,
    frame: OverlayFrame,
    fading: bool,
}

/// Scripted page: elements are plain data, overlays and interactions are
/// recorded for assertions, and page events are injected by the test.
pub struct FakePage {
    elements: Mutex<Vec<ElementSnapshot>>,
    xpath: Mutex<HashMap<String, ElementSnapshot>>,
    overlays: Mutex<Vec<OverlayEntry>>,
    clicks: Mutex<Vec<ElementId>>,
    scrolls: Mutex<Vec<ElementId>>,
    click_failures: Mutex<HashSet<String>>,
    next_overlay: AtomicU64,
    events: broadcast::Sender<PageEvent>,
    html: Mutex<String>,
}

impl FakePage {
    pub fn new(elements: Vec<ElementSnapshot>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            elements: Mutex::new(elements),
            xpath: Mutex::new(HashMap::new()),
            overlays: Mutex::new(Vec::new()),
            clicks: Mutex::new(Vec::new()),
            scrolls: Mutex::new(Vec::new()),
            click_failures: Mutex::new(HashSet::new()),
            next_overlay: AtomicU64::new(1),
            events,
            html: Mutex::new(String::new()),
        }
    }

    pub fn register_xpath(&self, expr: &str, el: ElementSnapshot) {
        self.xpath.lock().unwrap().insert(expr.to_string(), el);
    }

    pub fn set_rect(&self, id: &str, rect: Rect) {
        let mut elements = self.elements.lock().unwrap();
        if let Some(el) = elements.iter_mut().find(|el| el.id.0 == id) {
            el.rect = rect;
        }
    }

    pub fn remove_element(&self, id: &str) {
        self.elements.lock().unwrap().retain(|el| el.id.0 != id);
    }

    pub fn fail_clicks_on(&self, id: &str) {
        self.click_failures.lock().unwrap().insert(id.to_string());
    }

    pub fn emit(&self, event: PageEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_html(&self, html: &str) {
        *self.html.lock().unwrap() = html.to_string();
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays.lock().unwrap().len()
    }

    pub fn overlay_frames(&self) -> Vec<OverlayFrame> {
        self.overlays
            .lock()
            .unwrap()
            .iter()
            .map(|o| o.frame.clone())
            .collect()
    }

    pub fn overlay_kinds(&self) -> Vec<OverlayKind> {
        self.overlays.lock().unwrap().iter().map(|o| o.kind).collect()
    }

    pub fn fading_count(&self) -> usize {
        self.overlays.lock().unwrap().iter().filter(|o| o.fading).count()
    }

    pub fn clicked_ids(&self) -> Vec<String> {
        self.clicks.lock().unwrap().iter().map(|id| id.0.clone()).collect()
    }

    pub fn scrolled_ids(&self) -> Vec<String> {
        self.scrolls.lock().unwrap().iter().map(|id| id.0.clone()).collect()
    }

    fn lookup_rect(&self, id: &ElementId) -> Option<Rect> {
        if let Some(el) = self
            .elements
            .lock()
            .unwrap()
            .iter()
            .find(|el| el.id == *id)
        {
            return Some(el.rect);
        }
        self.xpath
            .lock()
            .unwrap()
            .values()
            .find(|el| el.id == *id)
            .map(|el| el.rect)
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn clickable_candidates(&self) -> Result<Vec<ElementSnapshot>, PageError> {
        Ok(self.elements.lock().unwrap().clone())
    }

    async fn find_by_xpath(&self, xpath: &str) -> Result<Option<ElementSnapshot>, PageError> {
        Ok(self.xpath.lock().unwrap().get(xpath).cloned())
    }

    async fn bounding_rect(&self, id: &ElementId) -> Result<Option<Rect>, PageError> {
        Ok(self.lookup_rect(id))
    }

    async fn scroll_into_view(&self, id: &ElementId) -> Result<(), PageError> {
        self.scrolls.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn click(&self, id: &ElementId) -> Result<(), PageError> {
        if self.click_failures.lock().unwrap().contains(&id.0) {
            return Err(PageError::Eval(format!("click threw on {id}")));
        }
        if self.lookup_rect(id).is_none() {
            return Err(PageError::Detached(id.0.clone()));
        }
        self.clicks.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn mount_overlay(
        &self,
        kind: OverlayKind,
        frame: &OverlayFrame,
    ) -> Result<OverlayId, PageError> {
        let id = OverlayId(format!(
            "ov-{}",
            self.next_overlay.fetch_add(1, Ordering::SeqCst)
        ));
        self.overlays.lock().unwrap().push(OverlayEntry {
            id: id.clone(),
            kind,
            frame: frame.clone(),
            fading: false,
        });
        Ok(id)
    }

    async fn position_overlay(
        &self,
        id: &OverlayId,
        frame: &OverlayFrame,
    ) -> Result<(), PageError> {
        let mut overlays = self.overlays.lock().unwrap();
        match overlays.iter_mut().find(|o| o.id == *id) {
            Some(entry) => {
                entry.frame = frame.clone();
                Ok(())
            }
            None => Err(PageError::UnknownOverlay(id.0.clone())),
        }
    }

    async fn begin_overlay_fade(&self, id: &OverlayId) -> Result<(), PageError> {
        let mut overlays = self.overlays.lock().unwrap();
        match overlays.iter_mut().find(|o| o.id == *id) {
            Some(entry) => {
                entry.fading = true;
                Ok(())
            }
            None => Err(PageError::UnknownOverlay(id.0.clone())),
        }
    }

    async fn remove_overlay(&self, id: &OverlayId) -> Result<(), PageError> {
        self.overlays.lock().unwrap().retain(|o| o.id != *id);
        Ok(())
    }

    async fn page_html(&self) -> Result<String, PageError> {
        Ok(self.html.lock().unwrap().clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub message_count: usize,
    pub rag_context: Option<String>,
    pub page_html: Option<String>,
}

/// Completion backend that replays a script, then a fixed fallback reply.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    calls: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedCompletion {
    pub fn with_replies(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: "Okay.".to_string(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every call gets the same reply. Useful for loop-bound tests.
    pub fn always(reply: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: reply.to_string(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded_contexts(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.rag_context.clone())
            .collect()
    }

    pub fn recorded_message_counts(&self) -> Vec<usize> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.message_count)
            .collect()
    }

    pub fn recorded_page_html(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.page_html.clone())
            .collect()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedCompletion {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(RecordedRequest {
            message_count: request.messages.len(),
            rag_context: request.rag_context.map(str::to_string),
            page_html: request.page_html.map(str::to_string),
        });
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(reply)
    }
}

/// Counts the call, then never resolves. Only a cancellation ends it.
pub struct HangingCompletion {
    calls: AtomicUsize,
}

impl HangingCompletion {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for HangingCompletion {
    async fn complete(&self, _request: CompletionRequest<'_>) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        unreachable!("pending future resolved")
    }
}

pub struct FailingCompletion {
    message: String,
}

impl FailingCompletion {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for FailingCompletion {
    async fn complete(&self, _request: CompletionRequest<'_>) -> Result<String, BackendError> {
        Err(BackendError::Status {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            message: self.message.clone(),
        })
    }
}

/// Retrieval backend returning a fixed chunk list (or a fixed failure).
pub struct ScriptedRetrieval {
    chunks: Vec<RetrievalChunk>,
    fail: bool,
    limits: Mutex<Vec<usize>>,
}

impl ScriptedRetrieval {
    pub fn empty() -> Self {
        Self::with_chunks(Vec::new())
    }

    pub fn with_chunks(chunks: Vec<RetrievalChunk>) -> Self {
        Self {
            chunks,
            fail: false,
            limits: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            chunks: Vec::new(),
            fail: true,
            limits: Mutex::new(Vec::new()),
        }
    }

    pub fn requested_limits(&self) -> Vec<usize> {
        self.limits.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetrievalBackend for ScriptedRetrieval {
    async fn retrieve(
        &self,
        _query: &str,
        limit: usize,
        _document_id: Option<&str>,
    ) -> Result<Vec<RetrievalChunk>, BackendError> {
        self.limits.lock().unwrap().push(limit);
        if self.fail {
            return Err(BackendError::Status {
                status: reqwest::StatusCode::BAD_GATEWAY,
                message: "retrieval backend unavailable".to_string(),
            });
        }
        Ok(self.chunks.iter().take(limit).cloned().collect())
    }
}
