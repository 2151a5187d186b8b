//! Orientation streaming between a sensor peer and a display peer.
//!
//! - [`domain`]: orientation model, calibration, session state machine, settings
//! - [`infrastructure`]: wire protocol, role drivers, transport substrate, logging
//! - [`presentation`]: status text built from [`domain::models::AppEvent`]s

pub mod domain;
pub mod infrastructure;
pub mod presentation;
