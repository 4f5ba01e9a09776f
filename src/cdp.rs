//! Production page driver over the Chrome DevTools Protocol.
//!
//! All DOM access goes through injected JavaScript evaluated on the tab; the
//! snippets tag interesting nodes with a `data-pagemate-id` attribute and
//! hand structured JSON back to Rust. A small page-side runtime
//! (`window.__pagemate`) carries the overlay registry, the pulse keyframes
//! and a queue of scroll/resize events drained by a pump task; it is
//! re-installed on every call so it survives navigations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::PageError;
use crate::page::{
    ElementId, ElementSnapshot, OverlayFrame, OverlayId, OverlayKind, PageDriver, PageEvent, Rect,
};
use crate::types::PAGE_HTML_MAX_CHARS;

/// Cadence of the page-event pump. Also the ceiling on how stale a
/// scroll/resize/navigation observation can be.
const EVENT_PUMP_INTERVAL_MS: u64 = 150;

const CLICKABLE_SELECTOR: &str =
    r#"a, [role="link"], button, [role="button"], input[type="button"], input[type="submit"]"#;

/// Page-side runtime, installed once per document. Evaluates to the state
/// object so snippets can open with `const pm = <RUNTIME_JS>;`.
const RUNTIME_JS: &str = r#"
(function () {
  if (!window.__pagemate) {
    const style = document.createElement('style');
    style.id = 'pagemate-spotlight-styles';
    style.textContent = [
      '@keyframes pagemate-pulse {',
      '  0%, 100% { box-shadow: 0 0 0 2px rgba(0,147,246,0.85), 0 0 16px rgba(0,147,246,0.55); }',
      '  50% { box-shadow: 0 0 0 4px rgba(0,147,246,1), 0 0 28px rgba(0,147,246,0.8); }',
      '}',
      '.pagemate-spotlight-overlay { animation: pagemate-pulse 1.6s ease-in-out infinite; }'
    ].join('\n');
    document.head.appendChild(style);

    const state = {
      nextElement: 1,
      nextOverlay: 1,
      overlays: {},
      events: []
    };
    state.pushEvent = function (kind) {
      if (state.events[state.events.length - 1] !== kind) state.events.push(kind);
    };
    window.addEventListener('scroll', function () { state.pushEvent('scrolled'); }, true);
    window.addEventListener('resize', function () { state.pushEvent('resized'); });

    state.tag = function (el) {
      if (!el.dataset.pagemateId) {
        el.dataset.pagemateId = 'pm-' + state.nextElement++;
      }
      return el.dataset.pagemateId;
    };
    state.find = function (id) {
      return document.querySelector('[data-pagemate-id="' + id + '"]');
    };
    state.snap = function (el) {
      const cs = getComputedStyle(el);
      const rect = el.getBoundingClientRect();
      const labelled = (el.getAttribute('aria-labelledby') || '')
        .split(/\s+/)
        .filter(Boolean)
        .map(function (id) {
          const ref = document.getElementById(id);
          return ref ? (ref.textContent || '') : '';
        })
        .join(' ');
      const img = el.querySelector ? el.querySelector('img[alt]') : null;
      return {
        id: state.tag(el),
        tag: el.tagName.toLowerCase(),
        rect: { left: rect.left, top: rect.top, width: rect.width, height: rect.height },
        display: cs.display,
        visibility: cs.visibility,
        opacity: cs.opacity,
        text_content: el.textContent || '',
        aria_label: el.getAttribute('aria-label') || '',
        labelledby_text: labelled,
        title: el.getAttribute('title') || '',
        value: 'value' in el ? String(el.value || '') : '',
        placeholder: el.getAttribute('placeholder') || '',
        image_alt: img ? (img.getAttribute('alt') || '') : '',
        border_radius: cs.borderRadius || ''
      };
    };
    window.__pagemate = state;
  }
  return window.__pagemate;
})()
"#;

/// Persistent browser session. Created once, reused for the whole run.
pub struct BrowserSession {
    _browser: Browser,
    pub tab: Arc<Tab>,
}

impl BrowserSession {
    /// Attach to a Chrome already listening on :9222, or launch our own
    /// instance with a persistent profile under the user cache dir.
    pub fn launch() -> anyhow::Result<Self> {
        info!("attempting to attach to Chrome on port 9222");
        if let Ok(browser) = Browser::connect("http://127.0.0.1:9222".to_string()) {
            let tab = {
                let tabs_lock = browser.get_tabs();
                let tabs = tabs_lock.lock().unwrap();
                match tabs.first() {
                    Some(tab) => tab.clone(),
                    None => browser.new_tab()?,
                }
            };
            info!("attached to running Chrome");
            return Ok(Self {
                _browser: browser,
                tab,
            });
        }

        info!("no running Chrome found, launching one");
        let profile = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pagemate")
            .join("chrome-profile");
        std::fs::create_dir_all(&profile)?;

        let options = LaunchOptions {
            headless: false,
            user_data_dir: Some(profile),
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        let browser = Browser::new(options)?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    pub fn navigate(&self, url: &str) -> anyhow::Result<()> {
        self.tab.navigate_to(url)?;
        self.tab.wait_for_element("body")?;
        Ok(())
    }
}

/// `PageDriver` over a live tab.
pub struct CdpPage {
    tab: Arc<Tab>,
    events: broadcast::Sender<PageEvent>,
}

impl CdpPage {
    pub fn new(tab: Arc<Tab>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let page = Arc::new(Self {
            tab: tab.clone(),
            events: events.clone(),
        });
        tokio::spawn(event_pump(tab, events));
        page
    }

    async fn eval_payload<T: DeserializeOwned>(&self, body: String) -> Result<T, PageError> {
        let raw = eval_string(&self.tab, wrap(&body)).await?;
        serde_json::from_str(&raw).map_err(|e| PageError::Eval(format!("bad page payload: {e}")))
    }
}

fn wrap(body: &str) -> String {
    format!("(() => {{\n  const pm = {RUNTIME_JS};\n{body}\n}})()")
}

/// JSON-escape a Rust string into a JS string literal.
fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Evaluate a snippet on the tab (blocking CDP call moved off the runtime)
/// and expect a JSON string result.
async fn eval_string(tab: &Arc<Tab>, js: String) -> Result<String, PageError> {
    let tab = tab.clone();
    let value = tokio::task::spawn_blocking(move || {
        tab.evaluate(&js, false)
            .map(|object| object.value)
            .map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| PageError::Session(format!("evaluation task failed: {e}")))?
    .map_err(PageError::Eval)?;

    match value {
        Some(serde_json::Value::String(s)) => Ok(s),
        other => Err(PageError::Eval(format!(
            "expected string result, got {other:?}"
        ))),
    }
}

#[derive(Deserialize)]
struct PumpPayload {
    href: String,
    events: Vec<String>,
}

/// Drains the page-side event queue and watches the location for
/// navigations. Evaluation failures (mid-navigation, tab busy) are skipped;
/// the next tick retries.
async fn event_pump(tab: Arc<Tab>, events: broadcast::Sender<PageEvent>) {
    let body = "const drained = pm.events.splice(0);\n\
                return JSON.stringify({ href: location.href, events: drained });"
        .to_string();
    let mut ticker = tokio::time::interval(Duration::from_millis(EVENT_PUMP_INTERVAL_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_href: Option<String> = None;

    loop {
        ticker.tick().await;
        let raw = match eval_string(&tab, wrap(&body)).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "event pump tick skipped");
                continue;
            }
        };
        let payload: PumpPayload = match serde_json::from_str(&raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "event pump payload unreadable");
                continue;
            }
        };

        if let Some(previous) = &last_href {
            if *previous != payload.href {
                let _ = events.send(PageEvent::Navigated {
                    url: payload.href.clone(),
                });
            }
        }
        last_href = Some(payload.href);

        for event in payload.events {
            let mapped = match event.as_str() {
                "scrolled" => PageEvent::Scrolled,
                "resized" => PageEvent::Resized,
                _ => continue,
            };
            let _ = events.send(mapped);
        }
    }
}

#[async_trait]
impl PageDriver for CdpPage {
    async fn clickable_candidates(&self) -> Result<Vec<ElementSnapshot>, PageError> {
        let body = format!(
            "const out = Array.from(document.querySelectorAll({selector})).map(function (el) {{ return pm.snap(el); }});\n\
             return JSON.stringify(out);",
            selector = js_str(CLICKABLE_SELECTOR)
        );
        self.eval_payload(body).await
    }

    async fn find_by_xpath(&self, xpath: &str) -> Result<Option<ElementSnapshot>, PageError> {
        let body = format!(
            "let node = null;\n\
             try {{\n\
               const result = document.evaluate({xpath}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null);\n\
               node = result.singleNodeValue;\n\
             }} catch (e) {{\n\
               return JSON.stringify(null);\n\
             }}\n\
             const el = node && node.nodeType === 1 ? node : (node && node.parentElement) || null;\n\
             return JSON.stringify(el ? pm.snap(el) : null);",
            xpath = js_str(xpath)
        );
        self.eval_payload(body).await
    }

    async fn bounding_rect(&self, id: &ElementId) -> Result<Option<Rect>, PageError> {
        let body = format!(
            "const el = pm.find({id});\n\
             if (!el) return JSON.stringify(null);\n\
             const r = el.getBoundingClientRect();\n\
             return JSON.stringify({{ left: r.left, top: r.top, width: r.width, height: r.height }});",
            id = js_str(&id.0)
        );
        self.eval_payload(body).await
    }

    async fn scroll_into_view(&self, id: &ElementId) -> Result<(), PageError> {
        let body = format!(
            "const el = pm.find({id});\n\
             if (!el) return JSON.stringify(false);\n\
             el.scrollIntoView({{ behavior: 'smooth', block: 'center' }});\n\
             return JSON.stringify(true);",
            id = js_str(&id.0)
        );
        let found: bool = self.eval_payload(body).await?;
        if found {
            Ok(())
        } else {
            Err(PageError::Detached(id.0.clone()))
        }
    }

    async fn click(&self, id: &ElementId) -> Result<(), PageError> {
        let body = format!(
            "const el = pm.find({id});\n\
             if (!el) return JSON.stringify('missing');\n\
             try {{ el.click(); }} catch (e) {{ return JSON.stringify('threw'); }}\n\
             return JSON.stringify('clicked');",
            id = js_str(&id.0)
        );
        let result: String = self.eval_payload(body).await?;
        match result.as_str() {
            "clicked" => Ok(()),
            "missing" => Err(PageError::Detached(id.0.clone())),
            other => Err(PageError::Eval(format!("click {other} on {id}"))),
        }
    }

    async fn mount_overlay(
        &self,
        kind: OverlayKind,
        frame: &OverlayFrame,
    ) -> Result<OverlayId, PageError> {
        let kind_js = match kind {
            OverlayKind::Spotlight => "spotlight",
            OverlayKind::Flash => "flash",
        };
        let body = format!(
            "const overlay = document.createElement('div');\n\
             overlay.style.position = 'fixed';\n\
             overlay.style.pointerEvents = 'none';\n\
             overlay.style.zIndex = '2147483647';\n\
             overlay.style.left = '{left}px';\n\
             overlay.style.top = '{top}px';\n\
             overlay.style.width = '{width}px';\n\
             overlay.style.height = '{height}px';\n\
             overlay.style.borderRadius = {radius};\n\
             if ({kind} === 'spotlight') {{\n\
               overlay.className = 'pagemate-spotlight-overlay';\n\
             }} else {{\n\
               overlay.style.boxShadow = '0 0 0 3px rgba(0,147,246,0.9), 0 0 16px rgba(0,147,246,0.6)';\n\
               overlay.style.transition = 'opacity 400ms ease';\n\
               overlay.style.opacity = '1';\n\
             }}\n\
             document.body.appendChild(overlay);\n\
             const id = 'pm-ov-' + pm.nextOverlay++;\n\
             pm.overlays[id] = overlay;\n\
             return JSON.stringify(id);",
            left = frame.left,
            top = frame.top,
            width = frame.width,
            height = frame.height,
            radius = js_str(&frame.border_radius),
            kind = js_str(kind_js),
        );
        let id: String = self.eval_payload(body).await?;
        Ok(OverlayId(id))
    }

    async fn position_overlay(
        &self,
        id: &OverlayId,
        frame: &OverlayFrame,
    ) -> Result<(), PageError> {
        let body = format!(
            "const overlay = pm.overlays[{id}];\n\
             if (!overlay) return JSON.stringify(false);\n\
             overlay.style.left = '{left}px';\n\
             overlay.style.top = '{top}px';\n\
             overlay.style.width = '{width}px';\n\
             overlay.style.height = '{height}px';\n\
             overlay.style.borderRadius = {radius};\n\
             return JSON.stringify(true);",
            id = js_str(&id.0),
            left = frame.left,
            top = frame.top,
            width = frame.width,
            height = frame.height,
            radius = js_str(&frame.border_radius),
        );
        let found: bool = self.eval_payload(body).await?;
        if found {
            Ok(())
        } else {
            Err(PageError::UnknownOverlay(id.0.clone()))
        }
    }

    async fn begin_overlay_fade(&self, id: &OverlayId) -> Result<(), PageError> {
        let body = format!(
            "const overlay = pm.overlays[{id}];\n\
             if (overlay) overlay.style.opacity = '0';\n\
             return JSON.stringify(true);",
            id = js_str(&id.0)
        );
        let _: bool = self.eval_payload(body).await?;
        Ok(())
    }

    async fn remove_overlay(&self, id: &OverlayId) -> Result<(), PageError> {
        let body = format!(
            "const overlay = pm.overlays[{id}];\n\
             if (overlay) {{ overlay.remove(); delete pm.overlays[{id}]; }}\n\
             return JSON.stringify(true);",
            id = js_str(&id.0)
        );
        let _: bool = self.eval_payload(body).await?;
        Ok(())
    }

    async fn page_html(&self) -> Result<String, PageError> {
        let body = "const clone = document.body.cloneNode(true);\n\
                    clone.querySelectorAll('script, style, noscript').forEach(function (n) { n.remove(); });\n\
                    return JSON.stringify(clone.innerHTML);"
            .to_string();
        let raw: String = self.eval_payload(body).await?;
        if raw.len() > PAGE_HTML_MAX_CHARS {
            let mut cut = PAGE_HTML_MAX_CHARS;
            while !raw.is_char_boundary(cut) {
                cut -= 1;
            }
            Ok(format!(
                "{}\n<!-- truncated, {} total chars -->",
                &raw[..cut],
                raw.len()
            ))
        } else {
            Ok(raw)
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }
}
