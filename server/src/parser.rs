//! Recovers an [`Artifact`] from raw model output.
//!
//! The artifact micro-language is a pair of `<artifact …>` tags wrapping any
//! number of `<action type="file|shell" …>` blocks. Surrounding prose is
//! ignored. An artifact whose closing tag is missing (truncated output) is not
//! salvaged: no match means no artifact, even when most actions before the
//! truncation point were well formed.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{Action, Artifact};

lazy_static! {
    static ref ARTIFACT_RE: Regex =
        Regex::new(r"(?s)<artifact\b([^>]*)>(.*?)</artifact>").expect("artifact pattern");
    static ref ACTION_RE: Regex =
        Regex::new(r"(?s)<action\b([^>]*)>(.*?)</action>").expect("action pattern");
    static ref ATTR_RE: Regex =
        Regex::new(r#"([A-Za-z_][\w\-]*)\s*=\s*"([^"]*)""#).expect("attribute pattern");
}

/// Parses the first artifact in `text`. Returns `None` when there is no
/// complete `<artifact>…</artifact>` pair; never fails.
pub fn parse_artifact(text: &str) -> Option<Artifact> {
    if text.is_empty() {
        return None;
    }

    let captures = ARTIFACT_RE.captures(text)?;
    let attrs = captures.get(1).map_or("", |m| m.as_str());
    let body = captures.get(2).map_or("", |m| m.as_str());

    Some(Artifact {
        id: attribute(attrs, |name| name == "id"),
        title: attribute(attrs, |name| name == "title"),
        actions: parse_actions(body),
    })
}

/// Single left-to-right scan; the returned order is document order.
fn parse_actions(body: &str) -> Vec<Action> {
    ACTION_RE
        .captures_iter(body)
        .filter_map(|cap| {
            let attrs = cap.get(1).map_or("", |m| m.as_str());
            let inner = cap.get(2).map_or("", |m| m.as_str()).trim();

            match attribute(attrs, |name| name == "type").as_deref() {
                Some("file") => {
                    // `filePath` and the older `filepath` are the same attribute
                    let path = attribute(attrs, |name| name.eq_ignore_ascii_case("filepath"))?;
                    if path.is_empty() {
                        return None;
                    }
                    Some(Action::file(path, inner))
                }
                Some("shell") if !inner.is_empty() => Some(Action::shell(inner)),
                _ => None,
            }
        })
        .collect()
}

fn attribute(attrs: &str, matches: impl Fn(&str) -> bool) -> Option<String> {
    ATTR_RE
        .captures_iter(attrs)
        .find(|cap| matches(&cap[1]))
        .map(|cap| cap[2].to_string())
}
