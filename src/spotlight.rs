//! Persistent spotlight overlay and one-shot flash highlight.
//!
//! The spotlight is the only shared mutable resource in the crate: a single
//! pulsing overlay that tracks its target while the page scrolls, resizes or
//! shifts. All mutation goes through [`SpotlightManager::activate`] /
//! [`SpotlightManager::clear`], both idempotent. Replace-not-stack: a new
//! activation always tears the previous overlay down first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PageError;
use crate::page::{
    ElementId, ElementSnapshot, OverlayFrame, OverlayId, OverlayKind, PageDriver, PageEvent, Rect,
};

/// Overlay frame extends the target rect by this much on every side.
pub const SPOTLIGHT_INSET_PX: f64 = 6.0;
/// Reposition cadence for layout shifts that produce no scroll/resize event.
pub const REPOSITION_INTERVAL_MS: u64 = 300;
/// Flash overlay starts fading this long after it appears.
pub const FLASH_FADE_DELAY_MS: u64 = 600;
/// ...and is removed this long after the fade starts.
pub const FLASH_REMOVE_DELAY_MS: u64 = 450;

const FALLBACK_RADIUS: &str = "8px";

/// Compute an overlay frame from a target rect and its computed
/// border-radius. Pixel radii grow by the inset so the outline follows the
/// target's curvature; percentage radii are kept verbatim; anything else
/// falls back to a fixed radius.
pub fn overlay_frame(rect: &Rect, border_radius: &str) -> OverlayFrame {
    OverlayFrame {
        left: rect.left - SPOTLIGHT_INSET_PX,
        top: rect.top - SPOTLIGHT_INSET_PX,
        width: rect.width + 2.0 * SPOTLIGHT_INSET_PX,
        height: rect.height + 2.0 * SPOTLIGHT_INSET_PX,
        border_radius: expand_radius(border_radius),
    }
}

fn expand_radius(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return FALLBACK_RADIUS.to_string();
    }
    trimmed
        .split_whitespace()
        .map(|part| {
            if part.ends_with('%') {
                part.to_string()
            } else if let Some(number) = part.strip_suffix("px") {
                match number.parse::<f64>() {
                    Ok(px) => format!("{}px", px + SPOTLIGHT_INSET_PX),
                    Err(_) => FALLBACK_RADIUS.to_string(),
                }
            } else {
                FALLBACK_RADIUS.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

struct ActiveSpotlight {
    overlay: OverlayId,
    target: ElementId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owner of the single persistent spotlight overlay.
pub struct SpotlightManager {
    driver: Arc<dyn PageDriver>,
    active: Mutex<Option<ActiveSpotlight>>,
}

impl SpotlightManager {
    pub fn new(driver: Arc<dyn PageDriver>) -> Self {
        Self {
            driver,
            active: Mutex::new(None),
        }
    }

    /// Spotlight a target, replacing any previous spotlight. The overlay is
    /// repositioned on scroll/resize events and on a fixed interval until
    /// replaced or cleared.
    pub async fn activate(&self, target: &ElementSnapshot) -> Result<(), PageError> {
        self.clear().await;

        let rect = self
            .driver
            .bounding_rect(&target.id)
            .await?
            .unwrap_or(target.rect);
        let frame = overlay_frame(&rect, &target.border_radius);
        let overlay = self
            .driver
            .mount_overlay(OverlayKind::Spotlight, &frame)
            .await?;

        // The subscription must exist before this call returns; an event
        // arriving before the loop task starts is still delivered.
        let events = self.driver.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reposition_loop(
            self.driver.clone(),
            overlay.clone(),
            target.id.clone(),
            target.border_radius.clone(),
            events,
            cancel.clone(),
        ));

        debug!(element = %target.id, "spotlight activated");
        *self.active.lock().await = Some(ActiveSpotlight {
            overlay,
            target: target.id.clone(),
            cancel,
            task,
        });
        Ok(())
    }

    /// Tear down the active spotlight. No-op when already idle.
    pub async fn clear(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        active.cancel.cancel();
        active.task.abort();
        let _ = self.driver.remove_overlay(&active.overlay).await;
        debug!(element = %active.target, "spotlight cleared");
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

async fn reposition_loop(
    driver: Arc<dyn PageDriver>,
    overlay: OverlayId,
    target: ElementId,
    border_radius: String,
    mut events: tokio::sync::broadcast::Receiver<PageEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(REPOSITION_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(PageEvent::Scrolled) | Ok(PageEvent::Resized) => {
                    reposition(&driver, &overlay, &target, &border_radius).await;
                }
                Ok(PageEvent::Navigated { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    reposition(&driver, &overlay, &target, &border_radius).await;
                }
            },
            _ = ticker.tick() => {
                reposition(&driver, &overlay, &target, &border_radius).await;
            }
        }
    }
}

/// Best-effort: when the target's rect cannot be computed (detached node,
/// evaluation error) the overlay keeps its last position until the next
/// successful pass or until cleared.
async fn reposition(
    driver: &Arc<dyn PageDriver>,
    overlay: &OverlayId,
    target: &ElementId,
    border_radius: &str,
) {
    if let Ok(Some(rect)) = driver.bounding_rect(target).await {
        let _ = driver
            .position_overlay(overlay, &overlay_frame(&rect, border_radius))
            .await;
    }
}

/// One-shot confirmation flash. Stateless: does not touch the spotlight and
/// several flashes may coexist while fading out.
pub async fn flash_highlight(
    driver: &Arc<dyn PageDriver>,
    target: &ElementSnapshot,
) -> Result<(), PageError> {
    let rect = driver
        .bounding_rect(&target.id)
        .await?
        .unwrap_or(target.rect);
    let frame = overlay_frame(&rect, &target.border_radius);
    let overlay = driver.mount_overlay(OverlayKind::Flash, &frame).await?;

    let driver = driver.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(FLASH_FADE_DELAY_MS)).await;
        let _ = driver.begin_overlay_fade(&overlay).await;
        tokio::time::sleep(Duration::from_millis(FLASH_REMOVE_DELAY_MS)).await;
        let _ = driver.remove_overlay(&overlay).await;
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{visible_element, FakePage};

    fn page_with(el: ElementSnapshot) -> Arc<FakePage> {
        Arc::new(FakePage::new(vec![el]))
    }

    #[test]
    fn frame_expands_rect_by_inset() {
        let frame = overlay_frame(&Rect::new(100.0, 200.0, 80.0, 30.0), "");
        assert_eq!(frame.left, 94.0);
        assert_eq!(frame.top, 194.0);
        assert_eq!(frame.width, 92.0);
        assert_eq!(frame.height, 42.0);
        assert_eq!(frame.border_radius, "8px");
    }

    #[test]
    fn radius_rules() {
        assert_eq!(expand_radius("4px"), "10px");
        assert_eq!(expand_radius("4px 0px"), "10px 6px");
        assert_eq!(expand_radius("50%"), "50%");
        assert_eq!(expand_radius("4px 50%"), "10px 50%");
        assert_eq!(expand_radius(""), "8px");
        assert_eq!(expand_radius("auto"), "8px");
        assert_eq!(expand_radius("garbagepx"), "8px");
    }

    #[tokio::test]
    async fn replace_leaves_exactly_one_overlay_at_second_target() {
        let first = visible_element("first", "button", "One");
        let mut second = visible_element("second", "button", "Two");
        second.rect = Rect::new(300.0, 400.0, 50.0, 20.0);

        let page = Arc::new(FakePage::new(vec![first.clone(), second.clone()]));
        let manager = SpotlightManager::new(page.clone());

        manager.activate(&first).await.unwrap();
        manager.activate(&second).await.unwrap();

        let frames = page.overlay_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], overlay_frame(&second.rect, ""));
        manager.clear().await;
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let el = visible_element("el", "button", "One");
        let page = page_with(el.clone());
        let manager = SpotlightManager::new(page.clone());

        manager.clear().await;
        assert_eq!(page.overlay_count(), 0);

        manager.activate(&el).await.unwrap();
        manager.clear().await;
        manager.clear().await;
        assert_eq!(page.overlay_count(), 0);
        assert!(!manager.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn repositions_on_scroll_event() {
        let el = visible_element("el", "button", "One");
        let page = page_with(el.clone());
        let manager = SpotlightManager::new(page.clone());
        manager.activate(&el).await.unwrap();

        let moved = Rect::new(10.0, 500.0, 120.0, 40.0);
        page.set_rect("el", moved);
        page.emit(PageEvent::Scrolled);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(page.overlay_frames()[0], overlay_frame(&moved, ""));
        manager.clear().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interval_catches_silent_layout_shift() {
        let el = visible_element("el", "button", "One");
        let page = page_with(el.clone());
        let manager = SpotlightManager::new(page.clone());
        manager.activate(&el).await.unwrap();

        let moved = Rect::new(40.0, 40.0, 60.0, 60.0);
        page.set_rect("el", moved);
        tokio::time::sleep(Duration::from_millis(REPOSITION_INTERVAL_MS + 50)).await;

        assert_eq!(page.overlay_frames()[0], overlay_frame(&moved, ""));
        manager.clear().await;
    }

    #[tokio::test(start_paused = true)]
    async fn detached_target_keeps_last_frame() {
        let el = visible_element("el", "button", "One");
        let page = page_with(el.clone());
        let manager = SpotlightManager::new(page.clone());
        manager.activate(&el).await.unwrap();
        let before = page.overlay_frames();

        page.remove_element("el");
        tokio::time::sleep(Duration::from_millis(REPOSITION_INTERVAL_MS * 3)).await;

        assert_eq!(page.overlay_frames(), before);
        manager.clear().await;
    }

    #[tokio::test(start_paused = true)]
    async fn flash_fades_then_removes_and_can_overlap() {
        let el = visible_element("el", "button", "One");
        let page = page_with(el.clone());

        flash_highlight(&(page.clone() as Arc<dyn PageDriver>), &el)
            .await
            .unwrap();
        flash_highlight(&(page.clone() as Arc<dyn PageDriver>), &el)
            .await
            .unwrap();
        assert_eq!(page.overlay_count(), 2);

        tokio::time::sleep(Duration::from_millis(FLASH_FADE_DELAY_MS + 10)).await;
        assert_eq!(page.fading_count(), 2);
        assert_eq!(page.overlay_count(), 2);

        tokio::time::sleep(Duration::from_millis(FLASH_REMOVE_DELAY_MS + 10)).await;
        assert_eq!(page.overlay_count(), 0);
    }
}
