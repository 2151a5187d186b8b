//! One status label per role, rebuilt from [`AppEvent`]s.

use tracing::{debug, error, info, trace, warn};

use crate::domain::models::{AppEvent, MessageSeverity, Orientation, Role};
use crate::domain::session::SessionState;

#[derive(Debug, Clone)]
pub struct StatusView {
    display_label: String,
    source_label: String,
    last_remote: Option<Orientation>,
    remote_count: u64,
}

impl Default for StatusView {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusView {
    pub fn new() -> Self {
        Self {
            display_label: Role::Advertiser.to_string(),
            source_label: Role::Browser.to_string(),
            last_remote: None,
            remote_count: 0,
        }
    }

    pub fn apply(&mut self, event: &AppEvent) {
        match event {
            AppEvent::LogMessage(role, status) => {
                match status.severity {
                    MessageSeverity::Info | MessageSeverity::Success => {
                        info!("[{}] {}", role, status.message)
                    }
                    MessageSeverity::Warning => warn!("[{}] {}", role, status.message),
                    MessageSeverity::Error => error!("[{}] {}", role, status.message),
                }
                *self.label_mut(*role) = status.message.clone();
            }
            AppEvent::Session(role, transition) => {
                debug!("[{}] {}", role, transition);
                // Peer loss already produced its own message.
                let keep_loss = transition.to == SessionState::Disconnected
                    && self.label(*role) == "Lost Peer!";
                if !keep_loss {
                    *self.label_mut(*role) = format!("{}: {}", role, transition.to);
                }
            }
            AppEvent::LocalOrientation(o) => {
                trace!("[source] stream: {}", o);
                self.source_label = format!("stream: {}", o);
            }
            AppEvent::RemoteOrientation(o) => {
                trace!("[display] stream: {}", o);
                self.display_label = format!("stream: {}", o);
                self.last_remote = Some(*o);
                self.remote_count += 1;
            }
        }
    }

    pub fn label(&self, role: Role) -> &str {
        match role {
            Role::Advertiser => &self.display_label,
            Role::Browser => &self.source_label,
        }
    }

    fn label_mut(&mut self, role: Role) -> &mut String {
        match role {
            Role::Advertiser => &mut self.display_label,
            Role::Browser => &mut self.source_label,
        }
    }

    /// Most recent orientation rendered on the display side.
    pub fn last_remote(&self) -> Option<Orientation> {
        self.last_remote
    }

    pub fn remote_count(&self) -> u64 {
        self.remote_count
    }
}
