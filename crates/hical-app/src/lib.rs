//! HiCal application shell: service wiring and background task supervision.

pub mod services;

pub use services::{cloud_backend_for, AppServices, CloudMode, PlatformPorts};
