//! System-wide default constants.
//!
//! Centralises the crawl protocol's magic numbers. Grouped by subsystem
//! for easy discovery; anything operator-tunable lives in the TOML config
//! instead.

// ============================================================================
// Visit Protocol
// ============================================================================

/// Floor on the per-agent spacing between map queries (seconds).
pub const MIN_SCAN_DELAY_SECS: f64 = 10.0;

/// Minimum pause before any interactive action (seconds).
pub const ACTION_SPACING_FLOOR_SECS: f64 = 0.5;

/// Consecutive empty visits tolerated before the account is rotated.
pub const MAX_EMPTY_VISITS: u32 = 3;

/// Seconds after a successful visit before the status code resets.
pub const STATUS_RESET_SECS: f64 = 60.0;

/// Bootstrap visits retry in place this many times before giving up.
pub const BOOTSTRAP_ATTEMPTS: u32 = 3;

// ============================================================================
// Detailed Capture
// ============================================================================

/// Beyond this distance (meters) the agent advances toward the target
/// before the capture request.
pub const ENCOUNTER_RANGE_M: f64 = 48.0;

/// Distance (meters) the agent closes to when advancing toward a target.
pub const ENCOUNTER_APPROACH_M: f64 = 47.0;

/// Cap on the proportional settle delay after moving (seconds).
pub const ENCOUNTER_SETTLE_CAP_SECS: f64 = 1.1;

// ============================================================================
// Fort Interaction
// ============================================================================

/// Maximum distance (meters) at which a fort accepts interaction, minus
/// leeway for positional jitter.
pub const SPIN_RANGE_M: f64 = 36.0;

// ============================================================================
// Normalization & Caches
// ============================================================================

/// Upper bound on a trusted time-to-despawn report (milliseconds).
pub const TTH_MAX_MS: i64 = 90_000;

/// Tolerance window for cache membership on expiry timestamps (seconds).
pub const CACHE_TOLERANCE_SECS: u64 = 2;

/// Retention of unknown-expiry sightings before the summary update fires
/// (seconds). Just under an hour, matching the longest spawn cycle.
pub const MYSTERY_RETENTION_SECS: u64 = 3_510;

// ============================================================================
// Quota / Throttle
// ============================================================================

/// Length of one quota period (seconds).
pub const QUOTA_PERIOD_SECS: f64 = 60.0;

/// Sleep when the quota is exhausted and the refresh time is unknown
/// (seconds).
pub const QUOTA_UNKNOWN_SLEEP_SECS: f64 = 30.0;

// ============================================================================
// Session Setup
// ============================================================================

/// Client version advertised during session establishment.
pub const APP_VERSION: u32 = 7904;

/// Highest minimum-client-version the engine can satisfy. A forced
/// version above this halts the process.
pub const SUPPORTED_CLIENT_VERSION: (u16, u16, u16) = (0, 79, 4);

/// Default item bag capacity until the profile reports the real one.
pub const DEFAULT_ITEM_CAPACITY: u32 = 350;

/// Tutorial steps that must be marked complete for a usable account.
pub const REQUIRED_TUTORIAL_STEPS: [u8; 5] = [0, 1, 3, 4, 7];

/// Item id of the unlimited-use incubator.
pub const INFINITE_INCUBATOR_ITEM: u16 = 901;

// ============================================================================
// CAPTCHA
// ============================================================================

/// Poll interval while waiting for the solver vendor (seconds).
pub const CAPTCHA_POLL_SECS: u64 = 5;

/// Site key presented with challenge submissions.
pub const CAPTCHA_SITE_KEY: &str = "6LeeTScTAAAAADqvhqVMhPpr_vB9D364Ia-1dSgK";
