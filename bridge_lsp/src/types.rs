//! Editor-facing types for the bridge.
//!
//! These are small, owned mirrors of the lsp-types structures the bridge
//! actually needs.

use lsp_types::Uri;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// A position in a text document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Line number (0-indexed).
    pub line: u32,
    /// Column (0-indexed, UTF-16 code units on the wire).
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

impl From<lsp_types::Position> for Position {
    fn from(pos: lsp_types::Position) -> Self {
        Self {
            line: pos.line,
            character: pos.character,
        }
    }
}

impl From<Position> for lsp_types::Position {
    fn from(pos: Position) -> Self {
        Self {
            line: pos.line,
            character: pos.character,
        }
    }
}

/// A range in a text document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

impl From<lsp_types::Range> for Range {
    fn from(range: lsp_types::Range) -> Self {
        Self {
            start: range.start.into(),
            end: range.end.into(),
        }
    }
}

/// Where a hover is requested: a document and a cursor position.
///
/// Built fresh for every trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRequest {
    pub uri: Uri,
    pub position: Position,
}

impl PositionRequest {
    pub fn new(uri: Uri, line: u32, character: u32) -> Self {
        Self {
            uri,
            position: Position::new(line, character),
        }
    }

    /// Builds a request for an absolute file path.
    pub fn for_path(path: &Path, line: u32, character: u32) -> Option<Self> {
        path_to_uri(path).map(|uri| Self::new(uri, line, character))
    }
}

/// The logical command context against which single-flight is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerSlot {
    Generate,
    Show,
}

impl fmt::Display for TriggerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSlot::Generate => f.write_str("generate"),
            TriggerSlot::Show => f.write_str("show"),
        }
    }
}

/// A single (scheme, language) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentFilter {
    pub scheme: String,
    pub language: String,
}

impl DocumentFilter {
    pub fn new(scheme: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            language: language.into(),
        }
    }
}

/// Which documents take part in synchronization and hover.
///
/// Fixed once the session is configured; there are no mutators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentSelector {
    filters: Vec<DocumentFilter>,
}

impl DocumentSelector {
    pub fn new(filters: Vec<DocumentFilter>) -> Self {
        Self { filters }
    }

    pub fn filters(&self) -> &[DocumentFilter] {
        &self.filters
    }

    /// Returns true if any filter matches the scheme and language.
    pub fn matches(&self, scheme: &str, language: &str) -> bool {
        self.filters
            .iter()
            .any(|f| f.scheme == scheme && f.language == language)
    }

    /// Returns true if a file on disk belongs to the selector.
    pub fn matches_path(&self, path: &Path) -> bool {
        language_id_from_path(path).is_some_and(|lang| self.matches("file", lang))
    }

    /// Returns true if the document behind `uri` belongs to the selector.
    ///
    /// The language comes from the extension of the URI path.
    pub fn matches_uri(&self, uri: &Uri) -> bool {
        let Ok(url) = url::Url::parse(uri.as_str()) else {
            return false;
        };
        language_id_from_path(Path::new(url.path()))
            .is_some_and(|lang| self.matches(url.scheme(), lang))
    }
}

impl Default for DocumentSelector {
    fn default() -> Self {
        Self::new(
            ["go", "javascript", "typescript", "python"]
                .into_iter()
                .map(|lang| DocumentFilter::new("file", lang))
                .collect(),
        )
    }
}

/// Maps file extensions to LSP language IDs.
pub fn language_id_from_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    match ext {
        "rs" => Some("rust"),
        "py" => Some("python"),
        "js" | "mjs" | "cjs" => Some("javascript"),
        "ts" | "mts" | "cts" => Some("typescript"),
        "jsx" => Some("javascriptreact"),
        "tsx" => Some("typescriptreact"),
        "go" => Some("go"),
        "c" | "h" => Some("c"),
        "cpp" | "cc" | "cxx" | "hpp" | "hxx" => Some("cpp"),
        "java" => Some("java"),
        "rb" => Some("ruby"),
        "json" => Some("json"),
        "html" => Some("html"),
        "css" => Some("css"),
        "md" => Some("markdown"),
        "sh" | "bash" => Some("shellscript"),
        "yaml" | "yml" => Some("yaml"),
        "toml" => Some("toml"),
        _ => None,
    }
}

/// Converts an absolute path to an LSP URI.
pub fn path_to_uri(path: &Path) -> Option<Uri> {
    let url = url::Url::from_file_path(path).ok()?;
    url.as_str().parse::<Uri>().ok()
}
