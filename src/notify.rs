//! Webhook notifications
//!
//! Optional fire-and-forget webhooks for notable sightings and raids.
//! Notification delivery is fully asynchronous: the crawl loop schedules
//! a task and moves on, and failures are logged, never propagated.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::types::{Observation, RaidRecord, Sighting};

pub struct Notifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
    species: HashSet<u16>,
    creatures_enabled: bool,
    raids_enabled: bool,
}

impl Notifier {
    pub fn from_config(config: &NotifyConfig) -> Option<Arc<Self>> {
        if !config.enabled && !config.raids {
            return None;
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");
        Some(Arc::new(Self {
            http,
            webhook_url: config.webhook_url.clone(),
            species: config.pokemon_ids.clone(),
            creatures_enabled: config.enabled,
            raids_enabled: config.raids,
        }))
    }

    /// Whether a sighting should trigger a notification.
    pub fn eligible(&self, sighting: &Sighting) -> bool {
        self.creatures_enabled && self.species.contains(&sighting.pokemon_id)
    }

    pub fn raids_enabled(&self) -> bool {
        self.raids_enabled
    }

    /// Schedule an asynchronous sighting notification.
    pub fn notify_sighting(self: &Arc<Self>, sighting: Sighting, time_of_day: u8) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            notifier
                .post(serde_json::json!({
                    "event": "sighting",
                    "time_of_day": time_of_day,
                    "record": Observation::Pokemon(sighting),
                }))
                .await;
        });
    }

    /// Schedule an asynchronous raid notification.
    pub fn notify_raid(self: &Arc<Self>, raid: RaidRecord) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            notifier
                .post(serde_json::json!({
                    "event": "raid",
                    "record": Observation::Raid(raid),
                }))
                .await;
        });
    }

    async fn post(&self, body: serde_json::Value) {
        let Some(url) = &self.webhook_url else {
            debug!("No webhook URL configured, notification dropped");
            return;
        };
        match self.http.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "Webhook rejected notification"),
            Err(e) => warn!(error = %e, "Webhook delivery failed"),
        }
    }
}
