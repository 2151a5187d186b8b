//! Status notifications from a driver to the presentation layer.

use tokio::sync::mpsc;
use tracing::info;

use crate::domain::models::{AppEvent, MessageSeverity, Orientation, Role, StatusMessage};
use crate::domain::session::SessionTransition;

/// Sends [`AppEvent`]s tagged with the role of the driver that owns it.
///
/// A closed receiver is not an error: the stream keeps flowing without a UI.
#[derive(Debug, Clone)]
pub struct Notifier {
    role: Role,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl Notifier {
    pub fn new(role: Role, event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { role, event_sender }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transition(&self, transition: SessionTransition) {
        info!("[{}] session {}", self.role, transition);
        let _ = self
            .event_sender
            .send(AppEvent::Session(self.role, transition));
    }

    pub fn log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(
            self.role,
            StatusMessage::new(message, severity),
        ));
    }

    pub fn sent(&self, orientation: Orientation) {
        let _ = self
            .event_sender
            .send(AppEvent::LocalOrientation(orientation));
    }

    pub fn received(&self, orientation: Orientation) {
        let _ = self
            .event_sender
            .send(AppEvent::RemoteOrientation(orientation));
    }
}
