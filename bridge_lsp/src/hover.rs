//! Hover payload normalization and extraction.

use crate::types::Range;
use serde_json::Value;

/// One unit of hover content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HoverFragment {
    /// Content text. `None` when the server sent a fragment without a
    /// usable `value`.
    pub value: Option<String>,
    /// Range the hover applies to.
    pub range: Option<Range>,
}

impl HoverFragment {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            range: None,
        }
    }
}

/// A hover response that was present, possibly with no fragments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HoverResult {
    pub fragments: Vec<HoverFragment>,
}

impl HoverResult {
    pub fn new(fragments: Vec<HoverFragment>) -> Self {
        Self { fragments }
    }

    /// Normalizes a raw `textDocument/hover` result.
    ///
    /// Accepts a single `Hover` or an array of them. Returns `None` when the
    /// server had nothing at that position.
    pub fn from_response(result: Option<Value>) -> Option<Self> {
        let fragments = match result? {
            Value::Null => return None,
            Value::Array(hovers) => hovers.iter().flat_map(hover_fragments).collect(),
            hover => hover_fragments(&hover),
        };
        Some(Self { fragments })
    }
}

/// Fragments of one `Hover` object, in order.
fn hover_fragments(hover: &Value) -> Vec<HoverFragment> {
    let range = hover
        .get("range")
        .cloned()
        .and_then(|r| serde_json::from_value::<lsp_types::Range>(r).ok())
        .map(Range::from);

    let values: Vec<Option<String>> = match hover.get("contents") {
        Some(Value::Array(items)) => items.iter().map(content_value).collect(),
        Some(contents) => vec![content_value(contents)],
        None => vec![],
    };

    values
        .into_iter()
        .map(|value| HoverFragment { value, range })
        .collect()
}

/// Text of a `MarkedString` or `MarkupContent`.
fn content_value(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("value").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Picks the display payload out of a hover result.
///
/// Only the first fragment is used, verbatim. Returns `None` for "nothing to
/// show": no result, no fragments, or a first fragment without a value.
pub fn extract_display(result: Option<&HoverResult>) -> Option<String> {
    result?.fragments.first()?.value.clone()
}
