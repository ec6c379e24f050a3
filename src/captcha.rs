//! CAPTCHA solving
//!
//! Client for the external solver vendor's submit/poll protocol. A
//! challenge is submitted with the site key and challenge URL, yielding a
//! ticket id; the ticket is then polled at a fixed interval until the
//! token is ready. Any transport failure is a hard failure for the
//! attempt; the caller rotates the account. Vendor-side key errors
//! disable solving for the rest of the process.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, warn};

use crate::config::defaults::{CAPTCHA_POLL_SECS, CAPTCHA_SITE_KEY};
use crate::config::CaptchaConfig;

/// Vendor error codes that mean the API key itself is unusable.
const KEY_ERRORS: [&str; 3] = [
    "ERROR_WRONG_USER_KEY",
    "ERROR_KEY_DOES_NOT_EXIST",
    "ERROR_ZERO_BALANCE",
];

/// Poll sentinel meaning the solve is still in progress.
const NOT_READY: &str = "CAPCHA_NOT_READY";

#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error("CAPTCHA solving is disabled")]
    Disabled,
    #[error("HTTP error talking to solver: {0}")]
    Http(#[from] reqwest::Error),
    #[error("solver rejected submission: {0}")]
    Rejected(String),
    #[error("solver failed to produce a token: {0}")]
    Failed(String),
}

/// External challenge solver seam.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn enabled(&self) -> bool;

    /// Solve a challenge, returning the verification token.
    async fn solve(&self, challenge_url: &str) -> Result<String, SolveError>;
}

/// HTTP client for a 2captcha-compatible vendor.
pub struct VendorSolver {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    disabled: AtomicBool,
}

#[derive(Debug, serde::Deserialize)]
struct VendorResponse {
    status: i32,
    request: String,
}

impl VendorSolver {
    /// Build a solver from config; `None` when no API key is set.
    pub fn from_config(config: &CaptchaConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("Failed to build HTTP client");
        Some(Self {
            http,
            base_url: config.solver_url.trim_end_matches('/').to_string(),
            api_key,
            disabled: AtomicBool::new(false),
        })
    }

    /// Handle a vendor error code; key errors disable the solver.
    fn vendor_error(&self, code: String) -> SolveError {
        if KEY_ERRORS.contains(&code.as_str()) {
            error!(code = %code, "Solver vendor reported a key problem, disabling CAPTCHA solving");
            self.disabled.store(true, Ordering::Relaxed);
        }
        SolveError::Rejected(code)
    }
}

#[async_trait]
impl ChallengeSolver for VendorSolver {
    fn enabled(&self) -> bool {
        !self.disabled.load(Ordering::Relaxed)
    }

    async fn solve(&self, challenge_url: &str) -> Result<String, SolveError> {
        if !self.enabled() {
            return Err(SolveError::Disabled);
        }

        // Submit the challenge.
        let submitted: VendorResponse = self
            .http
            .post(format!("{}/in.php", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("method", "userrecaptcha"),
                ("googlekey", CAPTCHA_SITE_KEY),
                ("pageurl", challenge_url),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;

        if submitted.status != 1 {
            return Err(self.vendor_error(submitted.request));
        }
        let ticket = submitted.request;

        // Poll until the token is ready.
        loop {
            tokio::time::sleep(Duration::from_secs(CAPTCHA_POLL_SECS)).await;
            let polled: VendorResponse = self
                .http
                .get(format!("{}/res.php", self.base_url))
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", ticket.as_str()),
                    ("json", "1"),
                ])
                .send()
                .await?
                .json()
                .await?;

            if polled.request == NOT_READY {
                continue;
            }
            if polled.status != 1 {
                warn!(code = %polled.request, "Solver returned an error for ticket");
                return Err(SolveError::Failed(polled.request));
            }
            return Ok(polled.request);
        }
    }
}
