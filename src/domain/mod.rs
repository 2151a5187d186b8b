pub mod calibration;
pub mod models;
pub mod session;
pub mod settings;
