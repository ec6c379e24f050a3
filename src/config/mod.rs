//! Engine Configuration
//!
//! Operator-tunable settings loaded from TOML, with built-in defaults for
//! every field so an empty file (or none at all) yields a working setup.
//!
//! ## Loading Order
//!
//! 1. Explicit `--config` path
//! 2. `SPYGLASS_CONFIG` environment variable
//! 3. `spyglass.toml` in the current working directory
//! 4. Built-in defaults
//!
//! The loaded config is owned by the shared context passed to each worker;
//! there is no process-global accessor.

pub mod defaults;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

use crate::geo::{Bounds, Units};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one engine deployment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub login: LoginConfig,

    #[serde(default)]
    pub encounter: EncounterConfig,

    #[serde(default)]
    pub spin: SpinConfig,

    #[serde(default)]
    pub inventory: InventoryConfig,

    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub captcha: CaptchaConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub altitude: AltitudeConfig,
}

impl Config {
    /// Load configuration following the documented search order.
    pub fn load(explicit: Option<&Path>) -> Self {
        let candidate = explicit
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var("SPYGLASS_CONFIG").ok().map(Into::into))
            .or_else(|| {
                let default = std::path::PathBuf::from("spyglass.toml");
                default.exists().then_some(default)
            });

        let Some(path) = candidate else {
            info!("No config file found, using built-in defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str::<Config>(&raw) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded configuration");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Invalid config file, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read config file, using defaults");
                Self::default()
            }
        }
    }
}

// ============================================================================
// Scan
// ============================================================================

/// Crawl loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Per-agent spacing between map queries, seconds. Values below the
    /// built-in floor are clamped up.
    pub scan_delay_secs: f64,
    /// Unit used for speeds (status display and spin speed limit).
    pub speed_unit: Units,
    /// Operating boundary; points outside are never scheduled and
    /// discovered candidates outside are dropped.
    pub bounds: Bounds,
    /// Grid spacing of generated scan points, degrees.
    pub grid_step_deg: f64,
    /// Collect unseen candidate spawn points for future scheduling.
    pub more_points: bool,
    /// Cache computed cell covers per rounded point.
    pub cache_cells: bool,
    /// Store spawn identities numerically (hex-decoded) instead of keyed.
    pub numeric_spawn_ids: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            scan_delay_secs: defaults::MIN_SCAN_DELAY_SECS,
            speed_unit: Units::Meters,
            bounds: Bounds::default(),
            grid_step_deg: 0.0007,
            more_points: true,
            cache_cells: true,
            numeric_spawn_ids: true,
        }
    }
}

impl ScanConfig {
    /// Scan delay with the protocol floor applied.
    pub fn effective_scan_delay(&self) -> f64 {
        self.scan_delay_secs.max(defaults::MIN_SCAN_DELAY_SECS)
    }
}

// ============================================================================
// Login / Session
// ============================================================================

/// Authentication and session-establishment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub login_timeout_secs: u64,
    /// Bound on concurrent authentication sequences, process-wide.
    pub simultaneous_logins: usize,
    /// Bound on concurrent post-login setup sequences, process-wide.
    pub simultaneous_setup: usize,
    /// Run the full post-login request simulation instead of the minimal
    /// config fetch.
    pub app_simulation: bool,
    /// Drive the tutorial sequence for fresh accounts.
    pub complete_tutorial: bool,
    pub player_locale: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            login_timeout_secs: 15,
            simultaneous_logins: 2,
            simultaneous_setup: 4,
            app_simulation: true,
            complete_tutorial: false,
            player_locale: "en_US".to_string(),
        }
    }
}

// ============================================================================
// Detailed Capture
// ============================================================================

/// Which creatures get a detailed-capture sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncounterPolicy {
    #[default]
    None,
    /// Only species on the allow list.
    Some,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EncounterConfig {
    pub policy: EncounterPolicy,
    /// Species allow list for `policy = "some"`.
    #[serde(default)]
    pub ids: HashSet<u16>,
}

impl EncounterConfig {
    pub fn enabled(&self) -> bool {
        self.policy != EncounterPolicy::None
    }

    pub fn selects(&self, pokemon_id: u16) -> bool {
        match self.policy {
            EncounterPolicy::All => true,
            EncounterPolicy::Some => self.ids.contains(&pokemon_id),
            EncounterPolicy::None => false,
        }
    }
}

// ============================================================================
// Fort Interaction
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinConfig {
    pub enabled: bool,
    /// Per-agent cooldown between spin attempts, seconds.
    pub cooldown_secs: f64,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cooldown_secs: 300.0,
        }
    }
}

// ============================================================================
// Inventory
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InventoryConfig {
    /// Item id -> retained count; surplus is recycled when the bag fills.
    /// Empty disables bag cleaning.
    #[serde(default)]
    pub item_limits: HashMap<u16, u32>,
    pub incubate_eggs: bool,
}

// ============================================================================
// Throttle
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Fraction of the period maximum kept as a safety margin. Zero
    /// disables throttle gating entirely.
    pub spare_fraction: f64,
    /// How often the shared quota snapshot refreshes, seconds.
    pub refresh_interval_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            spare_fraction: 0.05,
            refresh_interval_secs: 5,
        }
    }
}

impl ThrottleConfig {
    pub fn enabled(&self) -> bool {
        self.spare_fraction > 0.0
    }
}

// ============================================================================
// CAPTCHA
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaConfig {
    /// Vendor API key. Absent disables solving; challenges bench the
    /// account instead.
    pub api_key: Option<String>,
    /// Solve attempts per account before it is benched.
    pub allowed_per_account: u32,
    pub solver_url: String,
    /// Prefer benched accounts when rotating, to burn down the bench.
    pub favor_benched: bool,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            allowed_per_account: 3,
            solver_url: "http://2captcha.com".to_string(),
            favor_benched: false,
        }
    }
}

// ============================================================================
// Proxies
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Egress proxies rotated round-robin; swapped out of turn on
    /// proxy-attributable failures.
    #[serde(default)]
    pub proxies: Vec<String>,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub raids: bool,
    pub webhook_url: Option<String>,
    /// Species that trigger a notification.
    #[serde(default)]
    pub pokemon_ids: HashSet<u16>,
}

// ============================================================================
// Altitude
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AltitudeConfig {
    /// Elevation service endpoint; absent falls back to random altitudes
    /// within the band below.
    pub url: Option<String>,
    pub fallback_min: f64,
    pub fallback_max: f64,
}

impl Default for AltitudeConfig {
    fn default() -> Self {
        Self {
            url: None,
            fallback_min: 300.0,
            fallback_max: 400.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.scan.workers > 0);
        assert!(config.scan.effective_scan_delay() >= defaults::MIN_SCAN_DELAY_SECS);
        assert!(!config.spin.enabled);
        assert!(config.captcha.api_key.is_none());
    }

    #[test]
    fn scan_delay_floor_applies() {
        let scan = ScanConfig {
            scan_delay_secs: 2.0,
            ..ScanConfig::default()
        };
        assert!((scan.effective_scan_delay() - defaults::MIN_SCAN_DELAY_SECS).abs() < f64::EPSILON);
    }

    #[test]
    fn encounter_policy_selection() {
        let mut config = EncounterConfig {
            policy: EncounterPolicy::Some,
            ids: HashSet::new(),
        };
        config.ids.insert(149);
        assert!(config.selects(149));
        assert!(!config.selects(16));

        config.policy = EncounterPolicy::All;
        assert!(config.selects(16));

        config.policy = EncounterPolicy::None;
        assert!(!config.selects(149));
    }

    #[test]
    fn toml_round_trip_with_partial_file() {
        let raw = r#"
            [scan]
            workers = 12
            scan_delay_secs = 11.5

            [spin]
            enabled = true
        "#;
        let config: Config = toml::from_str(raw).expect("parse");
        assert_eq!(config.scan.workers, 12);
        assert!(config.spin.enabled);
        // untouched sections fall back to defaults
        assert_eq!(config.login.max_retries, 3);
    }
}
