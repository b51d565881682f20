use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub recurrence: RecurrenceConfig,

    #[serde(default)]
    pub editor: EditorConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub calendar: CalendarConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the SQLite databases
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hical")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn events_db(&self) -> PathBuf {
        self.data_dir.join("events.db")
    }

    pub fn sync_db(&self) -> PathBuf {
        self.data_dir.join("cloud_sync.db")
    }

    pub fn calendar_db(&self) -> PathBuf {
        self.data_dir.join("calendar_links.db")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecurrenceConfig {
    /// Instances materialized when neither a count nor an end date is given
    #[serde(default = "default_indefinite_instances")]
    pub indefinite_instances: u32,

    /// Hard ceiling on a single expansion
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
}

fn default_indefinite_instances() -> u32 {
    7
}

fn default_max_instances() -> u32 {
    1000
}

impl Default for RecurrenceConfig {
    fn default() -> Self {
        Self {
            indefinite_instances: default_indefinite_instances(),
            max_instances: default_max_instances(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EditorConfig {
    #[serde(default = "default_autosave_delay_ms")]
    pub autosave_delay_ms: u64,
}

fn default_autosave_delay_ms() -> u64 {
    500
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            autosave_delay_ms: default_autosave_delay_ms(),
        }
    }
}

impl EditorConfig {
    pub fn autosave_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.autosave_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Clock hour (UTC) used as the reminder anchor for events without a start time
    #[serde(default = "default_all_day_reminder_hour")]
    pub all_day_reminder_hour: u32,
}

fn default_all_day_reminder_hour() -> u32 {
    9
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            all_day_reminder_hour: default_all_day_reminder_hour(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Base URL of the backend hosting the member-data-sync function
    #[serde(default = "default_cloud_base_url")]
    pub base_url: String,

    /// API key sent as bearer token (can be set via HICAL_CLOUD_API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Signed-in member id
    #[serde(default)]
    pub user_id: Option<String>,

    /// Automatic incremental sync once the last sync is older than this
    #[serde(default = "default_auto_sync_after_minutes")]
    pub auto_sync_after_minutes: u32,
}

fn default_cloud_base_url() -> String {
    "http://localhost:54321".to_string()
}

fn default_auto_sync_after_minutes() -> u32 {
    60
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: default_cloud_base_url(),
            api_key: std::env::var("HICAL_CLOUD_API_KEY").ok(),
            user_id: None,
            auto_sync_after_minutes: default_auto_sync_after_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// Title of the app-owned native calendar
    #[serde(default = "default_dedicated_calendar_title")]
    pub dedicated_calendar_title: String,

    #[serde(default = "default_import_past_days")]
    pub import_past_days: u32,

    #[serde(default = "default_import_future_days")]
    pub import_future_days: u32,

    /// Timer-driven syncs closer together than this are skipped
    #[serde(default = "default_min_sync_interval_secs")]
    pub min_sync_interval_secs: u64,
}

/// Upper bound for either import window edge, about a century.
pub const MAX_IMPORT_WINDOW_DAYS: u32 = 36_500;

fn default_dedicated_calendar_title() -> String {
    "HiCalendar".to_string()
}

fn default_import_past_days() -> u32 {
    30
}

fn default_import_future_days() -> u32 {
    365
}

fn default_min_sync_interval_secs() -> u64 {
    300
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            dedicated_calendar_title: default_dedicated_calendar_title(),
            import_past_days: default_import_past_days(),
            import_future_days: default_import_future_days(),
            min_sync_interval_secs: default_min_sync_interval_secs(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from an explicit path, writing defaults there if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated() -> Result<(Self, ValidationResult)> {
        let config = Self::load()?;
        let validation = config.validate();

        if !validation.is_valid() {
            anyhow::bail!(
                "Configuration validation failed: {}",
                validation.error_summary()
            );
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Validate the configuration
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_url(&self.cloud.base_url, "cloud.base_url", &mut result);

        if self.cloud.api_key.is_none() {
            result.add_warning("cloud.api_key", "No API key set - cloud sync will fail");
        }

        if self.recurrence.indefinite_instances == 0 {
            result.add_error(
                "recurrence.indefinite_instances",
                "Horizon must be at least one instance",
            );
        }
        if self.recurrence.indefinite_instances > self.recurrence.max_instances {
            result.add_error(
                "recurrence.indefinite_instances",
                "Horizon cannot exceed recurrence.max_instances",
            );
        }

        if self.editor.autosave_delay_ms == 0 {
            result.add_warning("editor.autosave_delay_ms", "Autosave debounce disabled (0 ms)");
        } else if self.editor.autosave_delay_ms > 10_000 {
            result.add_warning(
                "editor.autosave_delay_ms",
                "Autosave delay is longer than 10 seconds",
            );
        }

        if self.notifications.all_day_reminder_hour > 23 {
            result.add_error(
                "notifications.all_day_reminder_hour",
                "Hour must be between 0 and 23",
            );
        }

        if self.calendar.dedicated_calendar_title.trim().is_empty() {
            result.add_error(
                "calendar.dedicated_calendar_title",
                "Dedicated calendar title cannot be empty",
            );
        }
        for (field, days) in [
            ("calendar.import_past_days", self.calendar.import_past_days),
            ("calendar.import_future_days", self.calendar.import_future_days),
        ] {
            if days > MAX_IMPORT_WINDOW_DAYS {
                result.add_error(
                    field,
                    format!("Import window cannot exceed {} days", MAX_IMPORT_WINDOW_DAYS),
                );
            }
        }

        result
    }

    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("hical");

        Ok(config_dir.join("config.toml"))
    }
}
