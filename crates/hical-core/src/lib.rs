pub mod config;
pub mod entitlements;
pub mod error;

pub use config::{
    CalendarConfig, CloudConfig, Config, EditorConfig, NotificationConfig, RecurrenceConfig,
    StorageConfig, ValidationResult,
};
pub use entitlements::{Entitlements, PremiumFlag};
pub use error::{
    AppError, AppResult, ConfigError, DatabaseError, ReqwestErrorExt, RusqliteErrorExt,
    TransportError,
};

use anyhow::Result;

/// Initialize logging for the HiCal services
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::info!("HiCal core initialized");
    Ok(())
}
