use std::fmt;
use std::ops::Sub;

use serde::{Deserialize, Serialize};

use crate::domain::session::SessionTransition;

/// Roll, pitch and yaw in radians.
///
/// Produced raw by the sensor, calibrated on the source side, or decoded from
/// a packet on the display side. No range is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl Orientation {
    pub const ZERO: Self = Self {
        roll: 0.0,
        pitch: 0.0,
        yaw: 0.0,
    };

    pub const fn new(roll: f32, pitch: f32, yaw: f32) -> Self {
        Self { roll, pitch, yaw }
    }
}

impl Sub for Orientation {
    type Output = Orientation;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            roll: self.roll - rhs.roll,
            pitch: self.pitch - rhs.pitch,
            yaw: self.yaw - rhs.yaw,
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} | {:.3} | {:.3}", self.roll, self.pitch, self.yaw)
    }
}

/// Opaque peer identity handed out by the transport (the peer's display name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self(display_name.into())
    }

    pub fn display_name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the pairing a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Display peer: publishes presence and receives orientation.
    Advertiser,
    /// Source peer: discovers the display and sends orientation.
    Browser,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Advertiser => f.write_str("display"),
            Role::Browser => f.write_str("source"),
        }
    }
}

/// Notifications for the presentation layer. Never part of the wire protocol.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// A session changed state on the given side.
    Session(Role, SessionTransition),
    /// Calibrated orientation just written to the stream.
    LocalOrientation(Orientation),
    /// Orientation decoded from the stream, ready to render.
    RemoteOrientation(Orientation),
    LogMessage(Role, StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
