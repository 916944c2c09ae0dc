//! The editor surface the bridge consumes.

use crate::notifications::Notification;
use funchaiku_lsp::PositionRequest;

/// Host editor as seen by the bridge.
///
/// Implementations are called from async tasks and must not block.
pub trait EditorHost: Send + Sync + 'static {
    /// Active document and cursor, if there is one.
    fn active_cursor(&self) -> Option<PositionRequest>;

    /// Shows a short user-visible message.
    fn present(&self, notification: Notification);
}
