//! Two deliberately separate grammars.
//!
//! The strict grammar (`parse_assistant_actions`) extracts `ACTION <VERB>
//! <target>` directives from assistant replies. The lenient grammar
//! (`parse_local_command`) recognizes a handful of natural-language commands
//! typed by the user; it is best-effort, yields at most one action and an
//! explicit no-match, and is never applied to assistant text.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::Action;

static ACTION_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bACTION\s+([A-Z_]+)\s*[:-]?\s*").unwrap());

static HIGHLIGHT_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)highlight\s+["']([^"']+)["']"#).unwrap());
static HIGHLIGHT_SUFFIXED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)highlight\s+(.+?)\s+(?:button|link|field)?$").unwrap());
static CLICK_BUTTON_WITH_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)click\s+(?:the\s+)?button\s+with\s+text\s+["']([^"']+)["']"#).unwrap()
});
static CLICK_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)click\s+["']([^"']+)["']"#).unwrap());
static CLICK_SUFFIXED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)click\s+(.+?)\s+button").unwrap());
static CLICK_XPATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)click\s+xpath\s+(.+)$").unwrap());
static CLICK_XPATH_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)click\s+((?://|\.//|/)\S.*)$").unwrap());
static HIGHLIGHT_XPATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)highlight\s+xpath\s+(.+)$").unwrap());
static HIGHLIGHT_XPATH_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)highlight\s+((?://|\.//|/)\S.*)$").unwrap());
static RETRIEVE_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:retrieve|search)\s+(.+)$").unwrap());

static XPATH_NORMALIZE_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[\s*normalize-space\s*\(").unwrap());
static XPATH_ATTR_EQ: Lazy<Regex> = Lazy::new(|| Regex::new(r"@\w+\s*=").unwrap());

/// Heuristic: does a directive target look like an XPath expression rather
/// than visible text?
pub fn is_likely_xpath(s: &str) -> bool {
    let t = s.trim();
    t.starts_with("//")
        || t.starts_with(".//")
        || t.starts_with('/')
        || XPATH_NORMALIZE_SPACE.is_match(t)
        || XPATH_ATTR_EQ.is_match(t)
}

/// Strip one surrounding matching quote/backtick pair.
fn dequote(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        let (first, last) = (bytes[0], bytes[s.len() - 1]);
        if first == last && matches!(first, b'"' | b'\'' | b'`') {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Parse every `ACTION <VERB> <target>` directive out of an assistant reply,
/// in textual order. The target runs to the next `ACTION` occurrence or end
/// of line, whichever comes first. Unknown verbs and empty targets are
/// skipped; a reply without directives is a normal outcome and parses to an
/// empty list.
///
/// Assistant-issued `CLICK`/`CLICK_XPATH` map to highlight actions; only
/// user-typed commands perform real clicks.
pub fn parse_assistant_actions(text: &str) -> Vec<Action> {
    let heads: Vec<(usize, usize, String)> = ACTION_HEAD
        .captures_iter(text)
        .map(|caps| {
            let whole = caps.get(0).unwrap();
            let verb = caps.get(1).unwrap().as_str().to_uppercase();
            (whole.start(), whole.end(), verb)
        })
        .collect();

    let mut actions = Vec::new();
    for (i, (_, tail_start, verb)) in heads.iter().enumerate() {
        let hard_end = heads
            .get(i + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(text.len());
        let slice = &text[*tail_start..hard_end.max(*tail_start)];
        let line = slice.split(['\n', '\r']).next().unwrap_or("");
        let target = dequote(line).trim();
        if target.is_empty() {
            continue;
        }

        let action = match verb.as_str() {
            "SPOTLIGHT" | "CLICK" => {
                if is_likely_xpath(target) {
                    Action::HighlightByXPath {
                        xpath: target.to_string(),
                    }
                } else {
                    Action::HighlightByText {
                        text: target.to_string(),
                    }
                }
            }
            "CLICK_XPATH" | "SPOTLIGHT_XPATH" => Action::HighlightByXPath {
                xpath: target.to_string(),
            },
            "RETRIEVE" => Action::Retrieve {
                query: target.to_string(),
                limit: None,
                document_id: None,
            },
            _ => continue,
        };
        actions.push(action);
    }
    actions
}

/// Recognize a user-typed natural-language command. First matching pattern
/// wins; `None` means "not a local command, send it to the backend".
pub fn parse_local_command(input: &str) -> Option<Action> {
    let text = input.trim();

    if let Some(caps) = HIGHLIGHT_QUOTED.captures(text) {
        return nonempty(caps[1].trim()).map(|text| Action::HighlightByText { text });
    }
    if let Some(caps) = HIGHLIGHT_SUFFIXED.captures(text) {
        return nonempty(caps[1].trim()).map(|text| Action::HighlightByText { text });
    }
    if let Some(caps) = CLICK_BUTTON_WITH_TEXT.captures(text) {
        return nonempty(caps[1].trim()).map(|text| Action::ClickByText { text });
    }
    if let Some(caps) = CLICK_QUOTED.captures(text) {
        return nonempty(caps[1].trim()).map(|text| Action::ClickByText { text });
    }
    if let Some(caps) = CLICK_SUFFIXED.captures(text) {
        return nonempty(caps[1].trim()).map(|text| Action::ClickByText { text });
    }
    if let Some(caps) = CLICK_XPATH
        .captures(text)
        .or_else(|| CLICK_XPATH_BARE.captures(text))
    {
        return nonempty(caps[1].trim()).map(|xpath| Action::ClickByXPath { xpath });
    }
    if let Some(caps) = HIGHLIGHT_XPATH
        .captures(text)
        .or_else(|| HIGHLIGHT_XPATH_BARE.captures(text))
    {
        return nonempty(caps[1].trim()).map(|xpath| Action::HighlightByXPath { xpath });
    }
    if let Some(caps) = RETRIEVE_COMMAND.captures(text) {
        return nonempty(caps[1].trim()).map(|query| Action::Retrieve {
            query,
            limit: None,
            document_id: None,
        });
    }
    None
}

fn nonempty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
