pub mod logging;
pub mod peer;
pub mod sensor;
