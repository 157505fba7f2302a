//! User-visible notifications delivered through the host.

use std::io::Write;
use tracing::info;

use crate::config::NotificationConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
}

impl From<&NotificationConfig> for Notification {
  fn from(config: &NotificationConfig) -> Self {
    Self {
      title: config.title.clone(),
      body: config.body.clone(),
      icon: config.icon.clone(),
      badge: config.badge.clone(),
    }
  }
}

pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification);
}

/// Prints notifications to stdout.
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
  fn show(&self, notification: &Notification) {
    info!(title = %notification.title, icon = %notification.icon, badge = %notification.badge, "notification");
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "[{}] {}", notification.title, notification.body);
  }
}

/// Keeps every notification it is shown.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
  shown: std::sync::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotifier {
  pub fn shown(&self) -> Vec<Notification> {
    self
      .shown
      .lock()
      .map(|shown| shown.clone())
      .unwrap_or_default()
  }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
  fn show(&self, notification: &Notification) {
    if let Ok(mut shown) = self.shown.lock() {
      shown.push(notification.clone());
    }
  }
}
