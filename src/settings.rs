use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    time::Duration,
};

use crate::delivery::{BackoffPolicy, DeliveryPolicy};
use crate::geo::{GeoPoint, GeofenceTarget, DEFAULT_RADIUS_METERS};

const API_KEY_ENV: &str = "FIELDCHECK_API_KEY";
const DEBUG_ENV: &str = "FIELDCHECK_DEBUG";
const DEBUG_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One year. Anything longer is a typo, and would overflow date arithmetic.
pub const MAX_RETENTION_HOURS: u32 = 24 * 365;
/// One day; covers backoff steps, attempt timeouts and poll intervals.
pub const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndpointSettings {
    /// Project URL of the attendance backend, e.g. `https://xyz.supabase.co`.
    pub base_url: String,
    pub table: String,
    pub api_key: Option<String>,
    pub attempt_timeout_secs: u64,
    /// Ask the server whether a key already landed before inserting.
    pub dedup_precheck: bool,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            table: "attendance".into(),
            api_key: None,
            attempt_timeout_secs: 15,
            dedup_precheck: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffSettings {
    pub base_secs: u64,
    pub cap_secs: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_secs: 5,
            cap_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub endpoint: EndpointSettings,
    pub retention_hours: u32,
    pub backoff: BackoffSettings,
    pub poll_interval_secs: u64,
    /// Geofence per unit code. A unit missing here cannot be checked into.
    pub units: BTreeMap<String, GeofenceTarget>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut units = BTreeMap::new();
        units.insert(
            "TTVH001".to_string(),
            GeofenceTarget {
                center: GeoPoint {
                    latitude: 11.3135,
                    longitude: 106.0981,
                },
                radius_meters: DEFAULT_RADIUS_METERS,
            },
        );

        Self {
            endpoint: EndpointSettings::default(),
            retention_hours: 24,
            backoff: BackoffSettings::default(),
            poll_interval_secs: 30,
            units,
        }
    }
}

impl Settings {
    /// Rejects values that would silently change delivery behaviour.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_RETENTION_HOURS).contains(&self.retention_hours) {
            bail!(
                "retentionHours must be between 1 and {MAX_RETENTION_HOURS}, got {}",
                self.retention_hours
            );
        }
        check_interval("pollIntervalSecs", self.poll_interval_secs)?;
        check_interval("endpoint.attemptTimeoutSecs", self.endpoint.attempt_timeout_secs)?;
        check_interval("backoff.baseSecs", self.backoff.base_secs)?;
        check_interval("backoff.capSecs", self.backoff.cap_secs)?;
        if self.endpoint.table.trim().is_empty() {
            bail!("endpoint.table must not be empty");
        }
        if self.backoff.cap_secs < self.backoff.base_secs {
            bail!(
                "backoff.capSecs ({}) is below backoff.baseSecs ({})",
                self.backoff.cap_secs,
                self.backoff.base_secs
            );
        }
        for (unit_code, target) in &self.units {
            if unit_code.trim().is_empty() {
                bail!("units contains an empty unit code");
            }
            target
                .validate()
                .with_context(|| format!("invalid geofence for unit {unit_code}"))?;
        }
        Ok(())
    }
}

fn check_interval(name: &str, secs: u64) -> Result<()> {
    if !(1..=MAX_INTERVAL_SECS).contains(&secs) {
        bail!("{name} must be between 1 and {MAX_INTERVAL_SECS} seconds, got {secs}");
    }
    Ok(())
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    /// Loads settings from `path`, writing the defaults there first if the
    /// file does not exist yet.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            let data: Settings = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse settings in {}", path.display()))?;
            data.validate()
                .with_context(|| format!("Invalid settings in {}", path.display()))?;
            data
        } else {
            let data = Settings::default();
            persist(&path, &data)?;
            data
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Settings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn endpoint(&self) -> EndpointSettings {
        self.snapshot().endpoint
    }

    pub fn units(&self) -> BTreeMap<String, GeofenceTarget> {
        self.snapshot().units
    }

    /// `FIELDCHECK_API_KEY` wins over the key stored on disk.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.snapshot().endpoint.api_key)
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        let settings = self.snapshot();
        DeliveryPolicy {
            retention: chrono::Duration::hours(i64::from(settings.retention_hours)),
            backoff: BackoffPolicy {
                base: Duration::from_secs(settings.backoff.base_secs),
                cap: Duration::from_secs(settings.backoff.cap_secs),
            },
            attempt_timeout: Duration::from_secs(settings.endpoint.attempt_timeout_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        if debug_mode() {
            DEBUG_POLL_INTERVAL
        } else {
            Duration::from_secs(self.snapshot().poll_interval_secs)
        }
    }
}

pub fn debug_mode() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn persist(path: &Path, data: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(data)?;
    fs::write(path, serialized)
        .with_context(|| format!("Failed to write settings to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_settings(dir: &TempDir, json: &str) -> PathBuf {
        let path = dir.path().join("settings.json");
        fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = SettingsStore::new(path.clone()).unwrap();
        assert!(path.exists());
        assert_eq!(store.snapshot(), Settings::default());

        let reopened = SettingsStore::new(path).unwrap();
        assert_eq!(reopened.snapshot(), Settings::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(
            &dir,
            r#"{
                "endpoint": { "baseUrl": "https://demo.supabase.co" },
                "retentionHours": 12,
                "units": {
                    "HQ": { "center": { "latitude": 10.77, "longitude": 106.69 } }
                }
            }"#,
        );

        let store = SettingsStore::new(path).unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.endpoint.base_url, "https://demo.supabase.co");
        assert_eq!(settings.endpoint.table, "attendance");
        assert_eq!(settings.units["HQ"].radius_meters, 100.0);
        assert!(!settings.units.contains_key("TTVH001"));

        let policy = store.delivery_policy();
        assert_eq!(policy.retention, chrono::Duration::hours(12));
        assert_eq!(policy.backoff, BackoffPolicy::default());
        assert_eq!(policy.attempt_timeout, Duration::from_secs(15));
    }

    #[test]
    fn malformed_json_is_an_error_not_a_default() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(&dir, "{ not json");
        assert!(SettingsStore::new(path).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        for json in [
            r#"{ "retentionHours": 0 }"#,
            r#"{ "retentionHours": 4000000000 }"#,
            r#"{ "backoff": { "baseSecs": 1000000000000000, "capSecs": 1000000000000000 } }"#,
            r#"{ "backoff": { "baseSecs": 5, "capSecs": 86401 } }"#,
            r#"{ "pollIntervalSecs": 0 }"#,
            r#"{ "endpoint": { "attemptTimeoutSecs": 18446744073709551615 } }"#,
            r#"{ "backoff": { "baseSecs": 60, "capSecs": 10 } }"#,
            r#"{ "endpoint": { "table": " " } }"#,
            r#"{ "units": { "X": { "center": { "latitude": 91, "longitude": 0 } } } }"#,
            r#"{ "units": { "X": { "center": { "latitude": 1, "longitude": 1 }, "radiusMeters": -5 } } }"#,
        ] {
            let path = write_settings(&dir, json);
            assert!(SettingsStore::new(path).is_err(), "{json} should be rejected");
        }
    }

    #[test]
    fn largest_accepted_values_still_make_a_usable_policy() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(
            &dir,
            r#"{ "retentionHours": 8760, "backoff": { "baseSecs": 86400, "capSecs": 86400 } }"#,
        );
        let policy = SettingsStore::new(path).unwrap().delivery_policy();
        assert_eq!(policy.retention, chrono::Duration::hours(8760));
        assert_eq!(policy.backoff.delay(u32::MAX), Duration::from_secs(86_400));
    }

    #[test]
    fn stored_api_key_is_used() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(&dir, r#"{ "endpoint": { "apiKey": "anon-key" } }"#);
        let store = SettingsStore::new(path).unwrap();
        // Only meaningful when the override is not set in the test environment.
        if std::env::var(API_KEY_ENV).is_err() {
            assert_eq!(store.api_key().as_deref(), Some("anon-key"));
        }
    }
}
