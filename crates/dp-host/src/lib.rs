//! §6's host API: one [`Device`] per process-group connection, plus the
//! mode-selection configuration (§6) and the closed `OffloadError` kind set
//! (§7) every fallible path on `Device` converts into.

pub mod config;
mod device;
mod error;

pub use config::{Config, ConfigFile, Mode};
pub use device::{Bounds, Device, ErrorCallback, PickResult, StatusCallback};
pub use error::OffloadError;
