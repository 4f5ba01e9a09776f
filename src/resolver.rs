//! Visibility-aware target resolution: map a human-readable description to a
//! concrete clickable element, exact label matches before substring matches.

use crate::page::{ElementSnapshot, PageDriver};
use crate::error::PageError;

/// Whether a candidate is meaningfully visible right now. Pure function of
/// the snapshot; the driver re-snapshots on every resolve so this reflects
/// live layout.
pub fn is_visible(el: &ElementSnapshot) -> bool {
    el.display != "none"
        && el.visibility != "hidden"
        && el.opacity != "0"
        && el.rect.width > 0.0
        && el.rect.height > 0.0
}

/// Best human-readable label for a candidate. First non-empty source wins:
/// text content, aria-label, aria-labelledby references, title, input
/// value/placeholder, descendant image alt. Empty string means "matches no
/// query".
pub fn accessible_label(el: &ElementSnapshot) -> &str {
    let text = el.text_content.trim();
    if !text.is_empty() {
        return text;
    }
    for source in [&el.aria_label, &el.labelledby_text, &el.title] {
        let trimmed = source.trim();
        if !trimmed.is_empty() {
            return trimmed;
        }
    }
    if el.tag == "input" {
        for source in [&el.value, &el.placeholder] {
            let trimmed = source.trim();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
    }
    el.image_alt.trim()
}

/// Collapse whitespace, trim, lowercase. Applied to both query and labels.
pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Find the best-matching visible clickable element for a free-text target
/// description. Exact normalized match first, then substring, document order
/// breaking ties within each tier.
pub async fn resolve(
    driver: &dyn PageDriver,
    query: &str,
) -> Result<Option<ElementSnapshot>, PageError> {
    let wanted = normalize(query);
    if wanted.is_empty() {
        return Ok(None);
    }

    let candidates = driver.clickable_candidates().await?;
    let labelled: Vec<(String, ElementSnapshot)> = candidates
        .into_iter()
        .filter(is_visible)
        .map(|el| (normalize(accessible_label(&el)), el))
        .collect();

    if let Some((_, el)) = labelled.iter().find(|(label, _)| *label == wanted) {
        return Ok(Some(el.clone()));
    }
    Ok(labelled
        .into_iter()
        .find(|(label, _)| !label.is_empty() && label.contains(&wanted))
        .map(|(_, el)| el))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Rect;
    use crate::testing::{visible_element, FakePage};
    use std::sync::Arc;

    fn base(text: &str) -> ElementSnapshot {
        visible_element("el", "button", text)
    }

    #[test]
    fn visibility_rejects_each_hidden_style() {
        let mut el = base("Go");
        assert!(is_visible(&el));

        el.display = "none".into();
        assert!(!is_visible(&el));

        let mut el = base("Go");
        el.visibility = "hidden".into();
        assert!(!is_visible(&el));

        let mut el = base("Go");
        el.opacity = "0".into();
        assert!(!is_visible(&el));

        let mut el = base("Go");
        el.rect = Rect::new(10.0, 10.0, 0.0, 40.0);
        assert!(!is_visible(&el));

        let mut el = base("Go");
        el.rect = Rect::new(10.0, 10.0, 120.0, 0.0);
        assert!(!is_visible(&el));
    }

    #[test]
    fn visibility_accepts_fractional_opacity() {
        let mut el = base("Go");
        el.opacity = "0.4".into();
        assert!(is_visible(&el));
    }

    #[test]
    fn label_priority_chain() {
        let mut el = base("  Visible text  ");
        assert_eq!(accessible_label(&el), "Visible text");

        el.text_content = String::new();
        el.aria_label = "Aria label".into();
        assert_eq!(accessible_label(&el), "Aria label");

        el.aria_label = String::new();
        el.labelledby_text = "Referenced label".into();
        assert_eq!(accessible_label(&el), "Referenced label");

        el.labelledby_text = String::new();
        el.title = "Title attr".into();
        assert_eq!(accessible_label(&el), "Title attr");

        el.title = String::new();
        el.value = "Submit".into();
        el.placeholder = "Type here".into();
        // value/placeholder only apply to inputs
        assert_eq!(accessible_label(&el), "");
        el.tag = "input".into();
        assert_eq!(accessible_label(&el), "Submit");
        el.value = String::new();
        assert_eq!(accessible_label(&el), "Type here");

        el.placeholder = String::new();
        el.image_alt = "Logo".into();
        assert_eq!(accessible_label(&el), "Logo");
    }

    #[test]
    fn normalize_collapses_and_lowercases() {
        assert_eq!(normalize("  Get   a\n Quote "), "get a quote");
    }

    #[tokio::test]
    async fn exact_match_beats_earlier_substring_match() {
        let page = Arc::new(FakePage::new(vec![
            visible_element("partial", "a", "Get a quote now"),
            visible_element("exact", "button", "Get a Quote"),
        ]));
        let found = resolve(page.as_ref(), "get a quote").await.unwrap().unwrap();
        assert_eq!(found.id.0, "exact");
    }

    #[tokio::test]
    async fn substring_fallback_in_document_order() {
        let page = Arc::new(FakePage::new(vec![
            visible_element("first", "a", "Track your claim here"),
            visible_element("second", "a", "claim here"),
        ]));
        let found = resolve(page.as_ref(), "claim").await.unwrap().unwrap();
        assert_eq!(found.id.0, "first");
    }

    #[tokio::test]
    async fn hidden_candidates_are_skipped() {
        let mut hidden = visible_element("hidden", "button", "Start Building");
        hidden.display = "none".into();
        let page = Arc::new(FakePage::new(vec![
            hidden,
            visible_element("shown", "button", "Start Building"),
        ]));
        let found = resolve(page.as_ref(), "Start Building")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id.0, "shown");
    }

    #[tokio::test]
    async fn empty_label_matches_nothing() {
        let page = Arc::new(FakePage::new(vec![visible_element("blank", "button", "")]));
        assert!(resolve(page.as_ref(), "anything").await.unwrap().is_none());
        // and an empty query resolves to nothing rather than the first element
        assert!(resolve(page.as_ref(), "   ").await.unwrap().is_none());
    }
}
