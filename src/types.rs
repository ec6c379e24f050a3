//! Shared data structures for the crawl / ingestion engine
//!
//! This module defines the closed set of record types flowing through the
//! engine:
//! - `Account`: pool record for one credential set
//! - `ScanJob`: one unit of crawl work (a map point, optionally targeted)
//! - `Observation`: the tagged union handed to the ingestion queue
//! - `WorkerReport` / `StatusCode`: per-worker observability snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::geo::Point;

// ============================================================================
// Spawn Identity
// ============================================================================

/// Stable identifier of a location where creatures periodically appear.
///
/// The remote API reports spawn points as hex strings; deployments that
/// store them numerically decode the hex form at normalization time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpawnId {
    Id(u64),
    Key(String),
}

impl SpawnId {
    /// Sentinel identity used for sightings synthesized from lured forts.
    pub fn lured(numeric: bool) -> Self {
        if numeric {
            SpawnId::Id(0)
        } else {
            SpawnId::Key("LURED".to_string())
        }
    }

    /// Parse a raw spawn point id into the configured representation.
    pub fn from_raw(raw: &str, numeric: bool) -> Self {
        if numeric {
            u64::from_str_radix(raw, 16)
                .map(SpawnId::Id)
                .unwrap_or_else(|_| SpawnId::Key(raw.to_string()))
        } else {
            SpawnId::Key(raw.to_string())
        }
    }
}

impl fmt::Display for SpawnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnId::Id(id) => write!(f, "{}", id),
            SpawnId::Key(key) => write!(f, "{}", key),
        }
    }
}

// ============================================================================
// Observations
// ============================================================================

/// How a sighting's despawn time was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Inference {
    /// The remote API reported a concrete time-to-despawn.
    Measured,
    /// Estimated from the spawn point's learned despawn cycle.
    Predicted,
    /// Synthesized from a lure; expiry is the lure's expiry.
    Lure,
}

/// Despawn information for a timed sighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expiry {
    /// Epoch second at which the creature despawns.
    pub expire_timestamp: u64,
    /// Seconds from observation until despawn.
    pub time_till_hidden: f64,
    pub inference: Inference,
}

/// Combat attributes merged in by a detailed-capture request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterDetails {
    pub move_1: u16,
    pub move_2: u16,
    pub individual_attack: u8,
    pub individual_defense: u8,
    pub individual_stamina: u8,
    pub height: f32,
    pub weight: f32,
    pub gender: u8,
}

/// A wild (or lured) creature observation.
///
/// `expiry == None` means the despawn time could not be determined; such
/// records travel as the `mystery` observation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub encounter_id: u64,
    pub pokemon_id: u16,
    pub spawn_id: SpawnId,
    pub lat: f64,
    pub lon: f64,
    /// Epoch second the creature was observed.
    pub seen: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<Expiry>,
    /// Display form, attached only when the API reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter: Option<EncounterDetails>,
}

/// Controlling team of a gym structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    #[default]
    None,
    Mystic,
    Valor,
    Instinct,
}

impl From<u8> for Team {
    fn from(raw: u8) -> Self {
        match raw {
            1 => Team::Mystic,
            2 => Team::Valor,
            3 => Team::Instinct,
            _ => Team::None,
        }
    }
}

/// A gym structure observation (spec kind `fort`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GymRecord {
    pub external_id: String,
    pub lat: f64,
    pub lon: f64,
    pub team: Team,
    pub prestige: u64,
    pub guard_pokemon_id: u16,
    pub slots_available: u32,
    /// Epoch second of the structure's last modification.
    pub last_modified: u64,
}

/// A point-of-interest observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PokestopRecord {
    pub external_id: String,
    pub lat: f64,
    pub lon: f64,
}

/// A raid event observation.
///
/// Boss fields are zero when no boss has been assigned yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaidRecord {
    pub external_id: u64,
    pub fort_external_id: String,
    pub lat: f64,
    pub lon: f64,
    pub level: u8,
    pub pokemon_id: u16,
    pub move_1: u16,
    pub move_2: u16,
    pub time_spawn: u64,
    pub time_battle: u64,
    pub time_end: u64,
}

/// A weather cell observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub s2_cell_id: u64,
    pub condition: u8,
    pub alert_severity: u8,
    pub warn: bool,
    pub day: u8,
}

/// The tagged observation record handed to the ingestion queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Observation {
    Pokemon(Sighting),
    Mystery(Sighting),
    Fort(GymRecord),
    Pokestop(PokestopRecord),
    Raid(RaidRecord),
    Weather(WeatherRecord),
    Target {
        spawn_id: SpawnId,
        seen: bool,
    },
    #[serde(rename = "mystery-update")]
    MysteryUpdate {
        encounter_id: u64,
        spawn_id: SpawnId,
        first: u64,
        last: u64,
    },
}

// ============================================================================
// Scan Jobs
// ============================================================================

/// One unit of crawl work handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanJob {
    pub point: Point,
    /// Expected spawn identity, used to measure scan coverage.
    pub spawn_id: Option<SpawnId>,
    /// Bootstrap visits relax health bookkeeping and retry in place.
    pub bootstrap: bool,
}

impl ScanJob {
    pub fn point(point: Point) -> Self {
        Self {
            point,
            spawn_id: None,
            bootstrap: false,
        }
    }

    pub fn targeted(point: Point, spawn_id: SpawnId) -> Self {
        Self {
            point,
            spawn_id: Some(spawn_id),
            bootstrap: false,
        }
    }

    pub fn bootstrap(point: Point) -> Self {
        Self {
            point,
            spawn_id: None,
            bootstrap: true,
        }
    }
}

// ============================================================================
// Accounts
// ============================================================================

fn default_provider() -> String {
    "ptc".to_string()
}

/// Pool record for one credential set.
///
/// Supplied and reclaimed via the account pool; workers mutate their copy
/// and write it back on rotation or shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Last known location (lat, lon).
    #[serde(default)]
    pub location: Option<Point>,
    /// Epoch second of the account's last remote request.
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub inventory_timestamp: u64,
    #[serde(default)]
    pub level: Option<u8>,
    /// Item id -> count snapshot of the account's bag.
    #[serde(default)]
    pub items: HashMap<u16, u32>,
    /// Timestamp of the last asset digest download, in remote units.
    #[serde(default)]
    pub asset_time: f64,
    /// Timestamp of the last item template download, in remote units.
    #[serde(default)]
    pub template_time: f64,
    /// Epoch second the account was created, when known.
    #[serde(default)]
    pub created: Option<f64>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub token_expiry: Option<f64>,
    #[serde(default)]
    pub warned: bool,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub captcha_flagged: bool,
}

impl Account {
    /// Whether the account can be handed to a worker at all.
    pub fn usable(&self) -> bool {
        !self.banned && !self.warned
    }

    /// Inert stand-in used while an account is being moved back to the
    /// pool during rotation. Never sent anywhere.
    pub fn placeholder() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            provider: default_provider(),
            location: None,
            time: 0.0,
            inventory_timestamp: 0,
            level: None,
            items: HashMap::new(),
            asset_time: 0.0,
            template_time: 0.0,
            created: None,
            auth_token: None,
            token_expiry: None,
            warned: false,
            banned: false,
            captcha_flagged: false,
        }
    }
}

// ============================================================================
// Worker Observability
// ============================================================================

/// Human-readable status code for one worker, shown on the status board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StatusCode {
    #[default]
    Init,
    WaitingForLogin,
    LoggingIn,
    Setup,
    Tutorial,
    Visiting,
    Bootstrapping,
    Encountering,
    Spinning,
    CleaningBag,
    Incubating,
    SolvingCaptcha,
    Seen,
    NothingSeen,
    EmptyVisit,
    Timeout,
    QuotaServiceOffline,
    EndpointOffline,
    QuotaExceeded,
    InvalidRequest,
    MalformedResponse,
    ProxyError,
    NotAuthenticated,
    Captcha,
    Warn,
    Banned,
    IpBanned,
    BadRequest,
    KeyExpired,
    QuotaServiceError,
    QuotaServiceBan,
    Swapping,
    Benching,
    Removing,
    Idle,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusCode::Init => "INIT",
            StatusCode::WaitingForLogin => "WAITING TO LOG IN",
            StatusCode::LoggingIn => "LOGIN",
            StatusCode::Setup => "SETUP",
            StatusCode::Tutorial => "TUTORIAL",
            StatusCode::Visiting => "VISITING",
            StatusCode::Bootstrapping => "BOOTSTRAPPING",
            StatusCode::Encountering => "ENCOUNTERING",
            StatusCode::Spinning => "SPINNING",
            StatusCode::CleaningBag => "CLEANING BAG",
            StatusCode::Incubating => "INCUBATING",
            StatusCode::SolvingCaptcha => "SOLVING CAPTCHA",
            StatusCode::Seen => "OK",
            StatusCode::NothingSeen => "0 SEEN",
            StatusCode::EmptyVisit => "EMPTY",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::QuotaServiceOffline => "QUOTA SERVICE OFFLINE",
            StatusCode::EndpointOffline => "ENDPOINT OFFLINE",
            StatusCode::QuotaExceeded => "QUOTA EXCEEDED",
            StatusCode::InvalidRequest => "INVALID REQUEST",
            StatusCode::MalformedResponse => "MALFORMED RESPONSE",
            StatusCode::ProxyError => "PROXY ERROR",
            StatusCode::NotAuthenticated => "NOT AUTHENTICATED",
            StatusCode::Captcha => "CAPTCHA",
            StatusCode::Warn => "WARN",
            StatusCode::Banned => "BANNED",
            StatusCode::IpBanned => "IP BANNED",
            StatusCode::BadRequest => "BAD REQUEST",
            StatusCode::KeyExpired => "KEY EXPIRED",
            StatusCode::QuotaServiceError => "QUOTA SERVICE ERROR",
            StatusCode::QuotaServiceBan => "QUOTA SERVICE BAN",
            StatusCode::Swapping => "SWAPPING",
            StatusCode::Benching => "BENCHING",
            StatusCode::Removing => "REMOVING",
            StatusCode::Idle => "IDLE",
        };
        f.write_str(text)
    }
}

/// Snapshot of one worker's state for the shared status board.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub position: Point,
    pub updated: DateTime<Utc>,
    /// Travel speed since the previous request, per hour in the
    /// configured unit.
    pub speed: f64,
    pub total_seen: u64,
    pub visits: u64,
    /// Creatures seen on the most recent visit.
    pub last_seen: u64,
    pub code: StatusCode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_id_hex_decoding() {
        assert_eq!(SpawnId::from_raw("1a2b", true), SpawnId::Id(0x1a2b));
        assert_eq!(
            SpawnId::from_raw("1a2b", false),
            SpawnId::Key("1a2b".to_string())
        );
    }

    #[test]
    fn lured_sentinel_matches_representation() {
        assert_eq!(SpawnId::lured(true), SpawnId::Id(0));
        assert_eq!(SpawnId::lured(false), SpawnId::Key("LURED".to_string()));
    }

    #[test]
    fn observation_kind_tags() {
        let target = Observation::Target {
            spawn_id: SpawnId::Id(7),
            seen: true,
        };
        let json = serde_json::to_value(&target).expect("serialize");
        assert_eq!(json["type"], "target");

        let update = Observation::MysteryUpdate {
            encounter_id: 1,
            spawn_id: SpawnId::Id(2),
            first: 10,
            last: 20,
        };
        let json = serde_json::to_value(&update).expect("serialize");
        assert_eq!(json["type"], "mystery-update");
    }

    #[test]
    fn account_usability() {
        let mut account = Account {
            username: "scout1".to_string(),
            password: "hunter2".to_string(),
            provider: "ptc".to_string(),
            location: None,
            time: 0.0,
            inventory_timestamp: 0,
            level: None,
            items: HashMap::new(),
            asset_time: 0.0,
            template_time: 0.0,
            created: None,
            auth_token: None,
            token_expiry: None,
            warned: false,
            banned: false,
            captcha_flagged: false,
        };
        assert!(account.usable());
        account.banned = true;
        assert!(!account.usable());
    }
}
