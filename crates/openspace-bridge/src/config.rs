//! Bridge tunables, persisted in the `settings` table.

use std::time::Duration;

use openspace_db::settings;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Settings key for the per-session output backlog cap, in bytes.
pub const SETTING_BACKLOG_CAP: &str = "terminal.backlog_cap_bytes";

/// Settings key for how long an unclaimed exit is remembered, in milliseconds.
pub const SETTING_EXIT_RETENTION: &str = "terminal.exit_retention_ms";

/// Settings keys for the size used before a surface reports its geometry.
pub const SETTING_DEFAULT_COLS: &str = "terminal.default_cols";
pub const SETTING_DEFAULT_ROWS: &str = "terminal.default_rows";

/// Settings key for the smallest cols/rows ever sent to the backend.
pub const SETTING_MIN_DIMENSION: &str = "terminal.min_dimension";

/// Settings key for the resize debounce frame, in milliseconds.
pub const SETTING_FRAME_INTERVAL: &str = "terminal.frame_interval_ms";

pub const DEFAULT_BACKLOG_CAP: usize = 1024 * 1024;
pub const DEFAULT_EXIT_RETENTION_MS: u64 = 30_000;
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 40;
pub const DEFAULT_MIN_DIMENSION: u16 = 2;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub backlog_cap_bytes: usize,
    pub exit_retention_ms: u64,
    pub default_cols: u16,
    pub default_rows: u16,
    pub min_dimension: u16,
    pub frame_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backlog_cap_bytes: DEFAULT_BACKLOG_CAP,
            exit_retention_ms: DEFAULT_EXIT_RETENTION_MS,
            default_cols: DEFAULT_COLS,
            default_rows: DEFAULT_ROWS,
            min_dimension: DEFAULT_MIN_DIMENSION,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
        }
    }
}

impl BridgeConfig {
    /// Read every tunable from the settings table.
    ///
    /// A missing or unparsable value falls back to its default.
    pub fn load(conn: &Connection) -> Self {
        let defaults = Self::default();
        Self {
            backlog_cap_bytes: read(conn, SETTING_BACKLOG_CAP, defaults.backlog_cap_bytes),
            exit_retention_ms: read(conn, SETTING_EXIT_RETENTION, defaults.exit_retention_ms),
            default_cols: read(conn, SETTING_DEFAULT_COLS, defaults.default_cols),
            default_rows: read(conn, SETTING_DEFAULT_ROWS, defaults.default_rows),
            min_dimension: read(conn, SETTING_MIN_DIMENSION, defaults.min_dimension),
            frame_interval_ms: read(conn, SETTING_FRAME_INTERVAL, defaults.frame_interval_ms),
        }
    }

    /// Write default values for every key that is not set yet.
    pub fn seed(conn: &Connection) -> rusqlite::Result<()> {
        let defaults = Self::default();
        settings::set_default(conn, SETTING_BACKLOG_CAP, &defaults.backlog_cap_bytes.to_string())?;
        settings::set_default(conn, SETTING_EXIT_RETENTION, &defaults.exit_retention_ms.to_string())?;
        settings::set_default(conn, SETTING_DEFAULT_COLS, &defaults.default_cols.to_string())?;
        settings::set_default(conn, SETTING_DEFAULT_ROWS, &defaults.default_rows.to_string())?;
        settings::set_default(conn, SETTING_MIN_DIMENSION, &defaults.min_dimension.to_string())?;
        settings::set_default(conn, SETTING_FRAME_INTERVAL, &defaults.frame_interval_ms.to_string())?;
        Ok(())
    }

    pub fn exit_retention(&self) -> Duration {
        Duration::from_millis(self.exit_retention_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Floor `value` to the configured minimum dimension.
    pub fn clamp_dimension(&self, value: u16) -> u16 {
        value.max(self.min_dimension)
    }
}

fn read<T: std::str::FromStr>(conn: &Connection, key: &str, fallback: T) -> T {
    match settings::get(conn, key) {
        Ok(Some(raw)) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("ignoring invalid value {raw:?} for setting {key}");
                fallback
            }
        },
        Ok(None) => fallback,
        Err(e) => {
            log::warn!("failed to read setting {key}: {e}");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_empty_store_uses_defaults() {
        let conn = openspace_db::open_in_memory().unwrap();
        assert_eq!(BridgeConfig::load(&conn), BridgeConfig::default());
    }

    #[test]
    fn test_load_reads_overrides() {
        let conn = openspace_db::open_in_memory().unwrap();
        settings::set(&conn, SETTING_BACKLOG_CAP, "8192").unwrap();
        settings::set(&conn, SETTING_EXIT_RETENTION, "5000").unwrap();

        let config = BridgeConfig::load(&conn);

        assert_eq!(config.backlog_cap_bytes, 8192);
        assert_eq!(config.exit_retention(), Duration::from_secs(5));
        assert_eq!(config.default_cols, DEFAULT_COLS);
    }

    #[test]
    fn test_invalid_value_falls_back() {
        let conn = openspace_db::open_in_memory().unwrap();
        settings::set(&conn, SETTING_DEFAULT_ROWS, "lots").unwrap();
        assert_eq!(BridgeConfig::load(&conn).default_rows, DEFAULT_ROWS);
    }

    #[test]
    fn test_seed_does_not_clobber() {
        let conn = openspace_db::open_in_memory().unwrap();
        settings::set(&conn, SETTING_FRAME_INTERVAL, "33").unwrap();

        BridgeConfig::seed(&conn).unwrap();

        assert_eq!(
            settings::get(&conn, SETTING_MIN_DIMENSION).unwrap().as_deref(),
            Some("2")
        );
        assert_eq!(BridgeConfig::load(&conn).frame_interval_ms, 33);
    }

    #[test]
    fn test_clamp_dimension() {
        let config = BridgeConfig::default();
        assert_eq!(config.clamp_dimension(0), 2);
        assert_eq!(config.clamp_dimension(1), 2);
        assert_eq!(config.clamp_dimension(80), 80);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{ "backlog_cap_bytes": 8192 }"#).unwrap();
        assert_eq!(config.backlog_cap_bytes, 8192);
        assert_eq!(config.exit_retention_ms, DEFAULT_EXIT_RETENTION_MS);
    }
}
