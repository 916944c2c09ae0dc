//! Transient notifications for user feedback.
//!
//! Hover content, startup failures and session warnings are all shown as
//! short-lived messages. Nothing here is persisted.

use funchaiku_lsp::LogLevel;
use std::fmt;
use std::time::{Duration, Instant};

/// Default lifetime of a notification.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(3);

/// Kind of notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for NotificationKind {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => NotificationKind::Error,
            LogLevel::Warning => NotificationKind::Warning,
            LogLevel::Info | LogLevel::Log => NotificationKind::Info,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NotificationKind::Info => "info",
            NotificationKind::Warning => "warning",
            NotificationKind::Error => "error",
        };
        f.write_str(label)
    }
}

/// A single notification.
#[derive(Debug, Clone)]
pub struct Notification {
    /// The notification message.
    pub message: String,
    pub kind: NotificationKind,
    /// When the notification was created.
    pub created_at: Instant,
    /// How long the notification should be visible.
    pub duration: Duration,
}

impl Notification {
    pub fn new(message: impl Into<String>, kind: NotificationKind) -> Self {
        Self {
            message: message.into(),
            kind,
            created_at: Instant::now(),
            duration: DEFAULT_DURATION,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(message, NotificationKind::Info)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(message, NotificationKind::Warning)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, NotificationKind::Error)
    }

    /// Returns whether this notification has expired.
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.duration
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Holds the notifications currently on screen.
#[derive(Debug)]
pub struct NotificationManager {
    notifications: Vec<Notification>,
    /// Maximum number of visible notifications.
    max_visible: usize,
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationManager {
    pub fn new() -> Self {
        Self {
            notifications: Vec::new(),
            max_visible: 5,
        }
    }

    /// Adds a notification.
    pub fn push(&mut self, notification: Notification) {
        self.notifications.push(notification);

        // Limit total notifications
        while self.notifications.len() > self.max_visible * 2 {
            self.notifications.remove(0);
        }
    }

    /// Removes expired notifications and returns whether any are still visible.
    pub fn update(&mut self) -> bool {
        self.notifications.retain(|n| !n.is_expired());
        !self.notifications.is_empty()
    }

    /// Returns the visible notifications (most recent first).
    pub fn visible(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.iter().rev().take(self.max_visible)
    }

    pub fn has_notifications(&self) -> bool {
        !self.notifications.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_creation() {
        let notification = Notification::info("Content 🌸 pond");
        assert_eq!(notification.message, "Content 🌸 pond");
        assert_eq!(notification.kind, NotificationKind::Info);
        assert_eq!(notification.duration, DEFAULT_DURATION);
        assert!(!notification.is_expired());
        assert_eq!(notification.to_string(), "[info] Content 🌸 pond");
    }

    #[test]
    fn test_notification_manager() {
        let mut manager = NotificationManager::new();
        manager.push(Notification::info("first"));
        manager.push(Notification::error("second"));

        assert!(manager.has_notifications());
        let visible: Vec<_> = manager.visible().map(|n| n.message.as_str()).collect();
        assert_eq!(visible, vec!["second", "first"]);
    }

    #[test]
    fn test_expired_notifications_are_dropped() {
        let mut manager = NotificationManager::new();
        manager.push(Notification {
            duration: Duration::ZERO,
            ..Notification::warning("gone")
        });
        manager.push(Notification::info("stays"));

        assert!(manager.update());
        let visible: Vec<_> = manager.visible().map(|n| n.message.as_str()).collect();
        assert_eq!(visible, vec!["stays"]);
    }

    #[test]
    fn test_manager_is_bounded() {
        let mut manager = NotificationManager::new();
        for i in 0..20 {
            manager.push(Notification::info(i.to_string()));
        }
        assert_eq!(manager.notifications.len(), 10);
        assert_eq!(manager.visible().count(), 5);
        assert_eq!(manager.visible().next().map(|n| n.message.as_str()), Some("19"));
    }

    #[test]
    fn test_server_levels_map_to_kinds() {
        assert_eq!(NotificationKind::from(LogLevel::Error), NotificationKind::Error);
        assert_eq!(NotificationKind::from(LogLevel::Log), NotificationKind::Info);
    }
}
