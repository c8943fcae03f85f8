use std::fs;

use directories::ProjectDirs;
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub webpulse: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const WEBPULSE_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            webpulse: Self::WEBPULSE_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.webpulse.clone();
        self.webpulse = self.webpulse.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.webpulse.as_str()) {
            eprintln!(
                "Config error: webpulse log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::WEBPULSE_LEVEL
            );
            self.webpulse = Self::WEBPULSE_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    /// A pending job older than this is considered stuck and re-announced
    /// by the backup runner.
    stale_after_minutes: i64,

    /// How far back the stale-recovery query looks. Wide enough to span a
    /// cross-midnight failure.
    lookback_hours: i64,
}

impl SchedulerConfig {
    const STALE_AFTER_MINUTES: i64 = 120;
    const LOOKBACK_HOURS: i64 = 48;

    pub fn stale_after_secs(&self) -> i64 {
        self.stale_after_minutes * 60
    }

    pub fn lookback_secs(&self) -> i64 {
        self.lookback_hours * 3600
    }

    fn default() -> Self {
        SchedulerConfig {
            stale_after_minutes: Self::STALE_AFTER_MINUTES,
            lookback_hours: Self::LOOKBACK_HOURS,
        }
    }

    fn ensure_valid(&mut self) {
        if self.stale_after_minutes <= 0 {
            eprintln!(
                "Config error: stale_after_minutes of {} is invalid - using default of {}",
                self.stale_after_minutes,
                Self::STALE_AFTER_MINUTES
            );
            self.stale_after_minutes = Self::STALE_AFTER_MINUTES;
        }
        if self.lookback_hours <= 0 || self.lookback_hours * 60 < self.stale_after_minutes {
            eprintln!(
                "Config error: lookback_hours of {} is invalid - using default of {}",
                self.lookback_hours,
                Self::LOOKBACK_HOURS
            );
            self.lookback_hours = Self::LOOKBACK_HOURS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CorrelationConfig {
    /// Metric movement within +/- this percentage is always classified
    /// as neutral.
    neutral_band_percent: f64,
}

impl CorrelationConfig {
    const NEUTRAL_BAND_PERCENT: f64 = 3.0;

    pub fn neutral_band_percent(&self) -> f64 {
        self.neutral_band_percent
    }

    fn default() -> Self {
        CorrelationConfig {
            neutral_band_percent: Self::NEUTRAL_BAND_PERCENT,
        }
    }

    fn ensure_valid(&mut self) {
        if !self.neutral_band_percent.is_finite()
            || self.neutral_band_percent < 0.0
            || self.neutral_band_percent > 50.0
        {
            eprintln!(
                "Config error: neutral_band_percent of {} is invalid - using default of {}",
                self.neutral_band_percent,
                Self::NEUTRAL_BAND_PERCENT
            );
            self.neutral_band_percent = Self::NEUTRAL_BAND_PERCENT;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub correlation: CorrelationConfig,
}

impl Config {
    pub fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            scheduler: SchedulerConfig::default(),
            correlation: CorrelationConfig::default(),
        }
    }

    /// Loads the configuration from a TOML file located in the app's data
    /// directory. If the file is missing or fails to parse, defaults are
    /// used. Additionally, writes the default config to disk if no file
    /// exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");

        let default_config = Config::default();

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(&config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(&config_path));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.scheduler.ensure_valid();
        self.correlation.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.logging.webpulse, "info");
        assert_eq!(config.scheduler.stale_after_secs(), 120 * 60);
        assert_eq!(config.scheduler.lookback_secs(), 48 * 3600);
        assert_eq!(config.correlation.neutral_band_percent(), 3.0);
    }

    #[test]
    fn test_ensure_valid_corrects_bad_values() {
        let mut config = Config::default();
        config.logging.webpulse = "VERBOSE".to_string();
        config.scheduler.stale_after_minutes = -5;
        config.scheduler.lookback_hours = 0;
        config.correlation.neutral_band_percent = -1.0;

        config.ensure_valid();

        assert_eq!(config.logging.webpulse, "info");
        assert_eq!(config.scheduler.stale_after_secs(), 120 * 60);
        assert_eq!(config.scheduler.lookback_secs(), 48 * 3600);
        assert_eq!(config.correlation.neutral_band_percent(), 3.0);
    }

    #[test]
    fn test_log_level_normalized() {
        let mut config = Config::default();
        config.logging.webpulse = "  Debug ".to_string();
        config.ensure_valid();
        assert_eq!(config.logging.webpulse, "debug");
    }
}
