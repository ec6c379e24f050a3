//! Remote API seam
//!
//! The wire-level encoding and cryptographic handshake with the remote
//! endpoint live in an external client library. This module defines the
//! boundary the engine programs against: a per-worker [`RemoteApi`] handle
//! created by a [`RemoteApiFactory`], the request envelope with its
//! piggyback sub-requests, the typed response set, and the transport error
//! taxonomy the recovery policies dispatch on.

pub mod sim;

use async_trait::async_trait;
use std::time::Duration;

// ============================================================================
// Errors
// ============================================================================

/// Transport-level failures reported by the remote client.
///
/// Each kind maps to exactly one recovery policy; see the request envelope
/// helper and the visit loop for the dispatch.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("request timed out")]
    Timeout,
    #[error("remote endpoint offline: {0}")]
    EndpointOffline(String),
    #[error("remote endpoint busy: {0}")]
    EndpointBusy(String),
    #[error("quota service offline: {0}")]
    QuotaServiceOffline(String),
    #[error("quota exceeded for this period")]
    QuotaExceeded {
        /// Epoch second at which the quota period refreshes, when known.
        refresh_at: Option<f64>,
    },
    #[error("quota service error: {0}")]
    QuotaServiceError(String),
    #[error("temporarily banned from the quota service")]
    QuotaServiceBan,
    #[error("API key expired: {0}")]
    ApiKeyExpired(String),
    #[error("session is not logged in")]
    NotLoggedIn,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("unexpected authentication failure: {0}")]
    AuthUnexpected(String),
    #[error("proxy failure: {0}")]
    Proxy(String),
    #[error("request rejected with code 3")]
    BadRequest,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("unexpected response: {0}")]
    Unexpected(String),
    #[error("egress address is banned")]
    IpBanned,
}

impl RemoteError {
    /// Discriminant used to log only the first occurrence of each kind
    /// within a retry loop.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteError::Timeout => "timeout",
            RemoteError::EndpointOffline(_) => "endpoint-offline",
            RemoteError::EndpointBusy(_) => "endpoint-busy",
            RemoteError::QuotaServiceOffline(_) => "quota-service-offline",
            RemoteError::QuotaExceeded { .. } => "quota-exceeded",
            RemoteError::QuotaServiceError(_) => "quota-service-error",
            RemoteError::QuotaServiceBan => "quota-service-ban",
            RemoteError::ApiKeyExpired(_) => "api-key-expired",
            RemoteError::NotLoggedIn => "not-logged-in",
            RemoteError::AuthFailed(_) => "auth-failed",
            RemoteError::AuthUnexpected(_) => "auth-unexpected",
            RemoteError::Proxy(_) => "proxy",
            RemoteError::BadRequest => "bad-request",
            RemoteError::InvalidRequest(_) => "invalid-request",
            RemoteError::Malformed(_) => "malformed",
            RemoteError::Unexpected(_) => "unexpected",
            RemoteError::IpBanned => "ip-banned",
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Credentials handed to the client for authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub provider: String,
    pub timeout: Duration,
}

/// Standard sub-requests piggybacked onto a main action.
#[derive(Debug, Clone, Default)]
pub struct Piggyback {
    pub check_challenge: bool,
    pub hatched_eggs: bool,
    /// `Some(ts)` requests an inventory delta since `ts`.
    pub inventory_since_ms: Option<u64>,
    pub awarded_badges: bool,
    /// `Some(hash)` requests settings; the hash is the last seen settings
    /// digest (`None` forces a full settings payload).
    pub settings_hash: Option<Option<String>>,
    pub buddy_walked: bool,
    pub inbox: bool,
}

/// Avatar configuration for account setup.
#[derive(Debug, Clone, Default)]
pub struct AvatarSpec {
    pub gender: u8,
    pub skin: u8,
    pub hair: u8,
    pub shirt: u8,
    pub pants: u8,
}

impl AvatarSpec {
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Self {
            gender: rng.gen_range(0..=1),
            skin: rng.gen_range(0..=3),
            hair: rng.gen_range(0..=5),
            shirt: rng.gen_range(0..=3),
            pants: rng.gen_range(0..=2),
        }
    }
}

/// The main action of one remote call.
#[derive(Debug, Clone)]
pub enum Action {
    /// Empty envelope, used by the session warm-up sequence.
    Ping,
    GetPlayer {
        locale: String,
    },
    GetPlayerProfile,
    DownloadRemoteConfig {
        platform: u8,
        app_version: u32,
    },
    GetAssetDigest {
        app_version: u32,
        page_offset: i32,
        page_timestamp: u64,
    },
    DownloadItemTemplates {
        page_offset: i32,
        page_timestamp: u64,
    },
    GetDownloadUrls {
        asset_ids: Vec<String>,
    },
    LevelUpRewards {
        level: u8,
    },
    GetStoreItems,
    MarkTutorialComplete {
        steps: Vec<u8>,
    },
    ListAvatarCustomizations,
    SetAvatar {
        avatar: AvatarSpec,
    },
    EncounterTutorialComplete {
        pokemon_id: u16,
    },
    ClaimCodename {
        codename: String,
    },
    SetBuddy {
        pokemon_id: u64,
    },
    GetMapObjects {
        cell_ids: Vec<u64>,
        latitude: f64,
        longitude: f64,
    },
    Encounter {
        encounter_id: u64,
        spawn_point_id: String,
        latitude: f64,
        longitude: f64,
    },
    FortDetails {
        fort_id: String,
        latitude: f64,
        longitude: f64,
    },
    FortSearch {
        fort_id: String,
        player_latitude: f64,
        player_longitude: f64,
        fort_latitude: f64,
        fort_longitude: f64,
    },
    RecycleItem {
        item_id: u16,
        count: u32,
    },
    UseIncubator {
        incubator_id: u64,
        egg_id: u64,
    },
    VerifyChallenge {
        token: String,
    },
}

/// One remote call: a main action plus its piggybacked sub-requests.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub action: Action,
    pub piggyback: Piggyback,
}

// ============================================================================
// Responses
// ============================================================================

/// Player profile payload.
#[derive(Debug, Clone, Default)]
pub struct PlayerData {
    pub warn: bool,
    pub banned: bool,
    pub tutorial_state: Vec<u8>,
    /// Zero when the API omits the real capacity.
    pub max_item_storage: u32,
    pub creation_timestamp_ms: u64,
}

/// One entry of an inventory delta.
#[derive(Debug, Clone)]
pub enum InventoryEntry {
    Item {
        id: u16,
        count: u32,
    },
    Egg {
        id: u64,
        km_target: f64,
        incubator_id: Option<u64>,
    },
    Incubator {
        id: u64,
        item_id: u16,
        in_use: bool,
    },
    /// A creature in the bag; used to find the tutorial starter.
    Creature {
        id: u64,
        pokemon_id: u16,
    },
    PlayerStats {
        level: u8,
    },
}

/// Inventory delta piggyback payload.
#[derive(Debug, Clone, Default)]
pub struct InventoryDelta {
    pub new_timestamp_ms: u64,
    pub entries: Vec<InventoryEntry>,
}

/// Settings piggyback payload.
#[derive(Debug, Clone, Default)]
pub struct SettingsData {
    pub hash: String,
    pub minimum_client_version: String,
}

/// Remote-config fetch payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteConfigData {
    pub asset_digest_timestamp_ms: u64,
    pub item_templates_timestamp_ms: u64,
}

/// One page of a paginated download (asset digest / item templates).
///
/// `result == 2` means more pages follow.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageData {
    pub result: i32,
    pub page_offset: i32,
    pub timestamp_ms: u64,
}

/// Detailed-capture payload.
#[derive(Debug, Clone, Default)]
pub struct EncounterPayload {
    pub move_1: u16,
    pub move_2: u16,
    pub individual_attack: u8,
    pub individual_defense: u8,
    pub individual_stamina: u8,
    pub height_m: f32,
    pub weight_kg: f32,
    pub gender: u8,
}

/// Fort interaction detail payload.
#[derive(Debug, Clone, Default)]
pub struct FortDetailsData {
    pub name: String,
}

/// Lure state on a point of interest.
#[derive(Debug, Clone, Copy)]
pub struct LureInfo {
    pub encounter_id: u64,
    pub active_pokemon_id: u16,
    pub lure_expires_timestamp_ms: u64,
}

/// Raid boss assignment.
#[derive(Debug, Clone, Copy)]
pub struct RaidBoss {
    pub pokemon_id: u16,
    pub move_1: u16,
    pub move_2: u16,
}

/// Raid state on a gym.
#[derive(Debug, Clone, Copy)]
pub struct RaidInfo {
    pub raid_seed: u64,
    pub raid_level: u8,
    pub raid_spawn_ms: u64,
    pub raid_battle_ms: u64,
    pub raid_end_ms: u64,
    pub boss: Option<RaidBoss>,
}

/// Structure kind reported by the map query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FortKind {
    Pokestop,
    Gym,
}

/// One fixed structure in a map cell.
#[derive(Debug, Clone)]
pub struct FortData {
    pub id: String,
    pub kind: FortKind,
    pub latitude: f64,
    pub longitude: f64,
    pub enabled: bool,
    pub last_modified_timestamp_ms: u64,
    /// Epoch ms until which this fort refuses interaction, zero if none.
    pub cooldown_complete_timestamp_ms: u64,
    pub owned_by_team: u8,
    pub gym_points: u64,
    pub guard_pokemon_id: u16,
    pub slots_available: u32,
    pub lure: Option<LureInfo>,
    pub raid: Option<RaidInfo>,
}

/// One wild creature in a map cell.
#[derive(Debug, Clone)]
pub struct WildCreature {
    pub encounter_id: u64,
    pub spawn_point_id: String,
    pub pokemon_id: u16,
    pub latitude: f64,
    pub longitude: f64,
    pub last_modified_timestamp_ms: u64,
    pub time_till_hidden_ms: i64,
    pub display_form: Option<u32>,
}

/// Candidate spawn location reported by the map query.
#[derive(Debug, Clone, Copy)]
pub struct SpawnPointData {
    pub latitude: f64,
    pub longitude: f64,
}

/// Climate state of a map cell.
#[derive(Debug, Clone, Copy)]
pub struct ClientWeather {
    pub s2_cell_id: u64,
    pub condition: u8,
    pub alert_severity: u8,
    pub warn: bool,
    pub day: u8,
}

/// One cell of a map-objects response.
#[derive(Debug, Clone, Default)]
pub struct MapCell {
    pub current_timestamp_ms: u64,
    pub wild_creatures: Vec<WildCreature>,
    pub forts: Vec<FortData>,
    pub spawn_points: Vec<SpawnPointData>,
    pub weather: Option<ClientWeather>,
}

/// Map-objects response.
#[derive(Debug, Clone, Default)]
pub struct MapObjects {
    /// 1 means success; anything else is an empty or rejected query.
    pub status: i32,
    pub cells: Vec<MapCell>,
    pub time_of_day: u8,
}

/// The full set of typed responses from one remote call.
///
/// Every field is optional: absence means the corresponding request was
/// not part of the envelope or the endpoint omitted the payload.
#[derive(Debug, Clone, Default)]
pub struct ResponseSet {
    pub player: Option<PlayerData>,
    pub map_objects: Option<MapObjects>,
    pub remote_config: Option<RemoteConfigData>,
    pub page: Option<PageData>,
    pub encounter: Option<EncounterPayload>,
    pub fort_details: Option<FortDetailsData>,
    /// Spin result code; see the spin protocol for the mapping.
    pub fort_search_result: Option<i32>,
    pub recycle_result: Option<i32>,
    pub incubator_result: Option<i32>,
    pub inventory: Option<InventoryDelta>,
    pub settings: Option<SettingsData>,
    /// Present and non-empty when the endpoint demands a CAPTCHA.
    pub challenge_url: Option<String>,
}

// ============================================================================
// Quota
// ============================================================================

/// Snapshot of the shared request-quota budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaSnapshot {
    pub maximum: u32,
    pub remaining: u32,
    /// Epoch second at which the current period ends.
    pub period_end: f64,
}

// ============================================================================
// Client Traits
// ============================================================================

/// Per-worker handle onto the remote client library.
///
/// A handle carries the session's position, proxy, and authentication
/// state; it is owned by exactly one worker and rebuilt on rotation.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    fn set_position(&mut self, lat: f64, lon: f64, altitude: f64);

    fn set_proxy(&mut self, proxy: Option<String>);

    fn proxy(&self) -> Option<String>;

    /// Restore a cached auth token. Returns whether the token was accepted
    /// (present and unexpired).
    fn restore_auth(&mut self, token: &str, expiry: f64) -> bool;

    fn authenticated(&self) -> bool;

    /// Cached auth token and its expiry, for pool write-back.
    fn auth_token(&self) -> Option<(String, f64)>;

    /// Exchange credentials for a usable session.
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), RemoteError>;

    /// Execute one envelope against the remote endpoint.
    async fn send(&mut self, envelope: RequestEnvelope) -> Result<ResponseSet, RemoteError>;
}

/// Factory for per-worker client handles plus the shared quota feed.
pub trait RemoteApiFactory: Send + Sync {
    fn create(&self) -> Box<dyn RemoteApi>;

    /// Latest quota budget reported by the quota authority, if any.
    fn quota_status(&self) -> Option<QuotaSnapshot>;
}
