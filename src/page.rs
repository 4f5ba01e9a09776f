//! The seam between the action-resolution core and a live page.
//!
//! Everything above this trait works on plain data (`ElementSnapshot`,
//! `Rect`), so the resolver, spotlight manager and orchestrator are testable
//! without a browser. The production implementation is [`crate::cdp::CdpPage`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::PageError;

/// Viewport-relative bounding box, CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Driver-scoped element handle. The CDP driver tags matched nodes with a
/// `data-pagemate-id` attribute and hands the value back here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub String);

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Point-in-time capture of one candidate element: computed style fields the
/// visibility predicate needs, plus every label source the extractor consults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub id: ElementId,
    pub tag: String,
    pub rect: Rect,
    pub display: String,
    pub visibility: String,
    pub opacity: String,
    pub text_content: String,
    pub aria_label: String,
    pub labelledby_text: String,
    pub title: String,
    pub value: String,
    pub placeholder: String,
    pub image_alt: String,
    pub border_radius: String,
}

/// Page-side happenings the spotlight manager and orchestrator react to.
#[derive(Debug, Clone)]
pub enum PageEvent {
    Scrolled,
    Resized,
    Navigated { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayKind {
    /// Persistent pulsing outline; at most one alive at a time.
    Spotlight,
    /// One-shot confirmation outline; fades and removes itself.
    Flash,
}

/// Where an overlay sits, already inset-expanded by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayFrame {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    pub border_radius: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OverlayId(pub String);

/// Object-safe handle to the live page.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// All clickable candidates in document order, freshly snapshotted.
    async fn clickable_candidates(&self) -> Result<Vec<ElementSnapshot>, PageError>;

    /// First node matching an XPath expression, if any.
    async fn find_by_xpath(&self, xpath: &str) -> Result<Option<ElementSnapshot>, PageError>;

    /// Live bounding rect; `None` when the element left the DOM.
    async fn bounding_rect(&self, id: &ElementId) -> Result<Option<Rect>, PageError>;

    async fn scroll_into_view(&self, id: &ElementId) -> Result<(), PageError>;

    async fn click(&self, id: &ElementId) -> Result<(), PageError>;

    async fn mount_overlay(
        &self,
        kind: OverlayKind,
        frame: &OverlayFrame,
    ) -> Result<OverlayId, PageError>;

    async fn position_overlay(
        &self,
        id: &OverlayId,
        frame: &OverlayFrame,
    ) -> Result<(), PageError>;

    /// Start the flash overlay's opacity fade.
    async fn begin_overlay_fade(&self, id: &OverlayId) -> Result<(), PageError>;

    async fn remove_overlay(&self, id: &OverlayId) -> Result<(), PageError>;

    /// Sanitized, size-capped body HTML for completion requests.
    async fn page_html(&self) -> Result<String, PageError>;

    fn subscribe(&self) -> broadcast::Receiver<PageEvent>;
}
