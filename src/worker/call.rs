//! Request envelope helper
//!
//! Every remote call goes through [`Worker::call`]: it prepends the
//! standard piggyback sub-requests, enforces the interactive-action
//! spacing, retries with per-kind recovery (short sleep, proxy swap,
//! reauthentication) up to the configured maximum, and applies the
//! observed side effects of a successful response (inventory delta,
//! settings digest, forced-version check, CAPTCHA challenge).

use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info, warn};

use super::Worker;
use crate::clock;
use crate::config::defaults::{
    ACTION_SPACING_FLOOR_SECS, QUOTA_UNKNOWN_SLEEP_SECS, SUPPORTED_CLIENT_VERSION,
};
use crate::remote::{Action, Piggyback, RemoteError, RequestEnvelope, ResponseSet};
use crate::types::StatusCode;

/// Failures escaping the envelope helper, dispatched exhaustively by the
/// visit loop.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("CAPTCHA required and unsolvable")]
    CaptchaRequired,
    #[error("CAPTCHA solve failed")]
    CaptchaSolveFailed,
    #[error("account is warned")]
    AccountWarned,
    #[error("account is banned")]
    AccountBanned,
    #[error("remote is forcing client version {0}")]
    VersionForced(String),
    #[error("visit cancelled")]
    Cancelled,
}

/// Per-call envelope options; defaults match a normal chained request.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Attach the standard piggyback sub-requests.
    pub chain: bool,
    pub buddy: bool,
    pub settings: bool,
    pub inbox: bool,
    /// Send the shared settings digest with the settings request; turned
    /// off to force a full settings payload (and the version check).
    pub dl_hash: bool,
    /// Seconds of in-game time this interactive action takes; enforces
    /// spacing before and pads the next-action time after.
    pub action: Option<f64>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            chain: true,
            buddy: true,
            settings: false,
            inbox: true,
            dl_hash: true,
            action: None,
        }
    }
}

impl CallOptions {
    /// No piggybacks at all.
    pub fn bare() -> Self {
        Self {
            chain: false,
            ..Self::default()
        }
    }
}

/// Parse a dotted client version for the forced-upgrade comparison.
fn parse_version(raw: &str) -> Option<(u16, u16, u16)> {
    let mut parts = raw.split('.').map(|p| p.parse::<u16>().ok());
    Some((parts.next()??, parts.next()??, parts.next()??))
}

impl Worker {
    fn build_envelope(&self, action: Action, opts: &CallOptions) -> RequestEnvelope {
        let piggyback = if opts.chain {
            Piggyback {
                check_challenge: true,
                hatched_eggs: true,
                inventory_since_ms: Some(self.session.inventory_timestamp),
                awarded_badges: true,
                settings_hash: opts.settings.then(|| {
                    if opts.dl_hash {
                        self.ctx.settings_hash()
                    } else {
                        None
                    }
                }),
                buddy_walked: opts.buddy,
                inbox: opts.inbox,
            }
        } else {
            Piggyback::default()
        };
        RequestEnvelope { action, piggyback }
    }

    /// Execute one envelope with recovery, side effects, and challenge
    /// inspection. Returns the full response set or the final
    /// unrecovered error.
    pub(crate) async fn call(
        &mut self,
        action: Action,
        opts: CallOptions,
    ) -> Result<ResponseSet, CallError> {
        if opts.action.is_some() {
            // Respect the spacing required by the previous interactive
            // action, with a half-second floor.
            let now = clock::epoch();
            let wait = if self.session.last_action > now + ACTION_SPACING_FLOOR_SECS {
                self.session.last_action - now
            } else {
                ACTION_SPACING_FLOOR_SECS
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }

        let mut responses = None;
        let mut last_err: Option<RemoteError> = None;
        let mut attempt = 0;
        while attempt <= self.ctx.config.login.max_retries {
            attempt += 1;
            let envelope = self.build_envelope(action.clone(), &opts);
            match self.api.send(envelope).await {
                Ok(set) => {
                    self.session.last_request = clock::epoch();
                    responses = Some(set);
                    last_err = None;
                    break;
                }
                Err(err) => {
                    let new_kind = last_err.as_ref().map(|e| e.kind()) != Some(err.kind());
                    match &err {
                        RemoteError::NotLoggedIn | RemoteError::AuthFailed(_) => {
                            info!(username = %self.session.account.username, error = %err, "Auth error");
                            tokio::time::sleep(Duration::from_secs(3)).await;
                            // `login` returns a boxed future to cut the
                            // call -> login -> call recursion cycle.
                            if !self.login(true).await? {
                                self.swap_account("reauth failed").await;
                            }
                        }
                        RemoteError::Timeout => {
                            self.set_code(StatusCode::Timeout);
                            if new_kind {
                                warn!("{}", err);
                            }
                            tokio::time::sleep(Duration::from_secs(10)).await;
                        }
                        RemoteError::QuotaServiceOffline(_) => {
                            self.set_code(StatusCode::QuotaServiceOffline);
                            if new_kind {
                                warn!("{}", err);
                            }
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        RemoteError::EndpointOffline(_) => {
                            self.set_code(StatusCode::EndpointOffline);
                            if new_kind {
                                warn!("{}", err);
                            }
                            self.random_sleep(10.1, 14.0).await;
                        }
                        RemoteError::QuotaExceeded { refresh_at } => {
                            self.set_code(StatusCode::QuotaExceeded);
                            if new_kind {
                                warn!("Request quota exceeded, sleeping until refresh");
                            }
                            let now = clock::epoch();
                            let sleep_secs = match refresh_at {
                                Some(refresh) if *refresh > now => *refresh - now + 1.0,
                                Some(_) => 5.0,
                                None => QUOTA_UNKNOWN_SLEEP_SECS,
                            };
                            tokio::time::sleep(Duration::from_secs_f64(sleep_secs)).await;
                        }
                        RemoteError::Proxy(_) => {
                            self.set_code(StatusCode::ProxyError);
                            if self.ctx.proxies.as_ref().is_some_and(|p| p.multi()) {
                                error!(error = %err, "Proxy failure, swapping proxy");
                                self.swap_proxy();
                            } else {
                                if new_kind {
                                    error!("{}", err);
                                }
                                tokio::time::sleep(Duration::from_secs(5)).await;
                            }
                        }
                        RemoteError::InvalidRequest(_) => {
                            self.session.last_request = clock::epoch();
                            self.set_code(StatusCode::InvalidRequest);
                            if new_kind {
                                warn!("{}", err);
                            }
                            self.random_sleep(10.1, 14.0).await;
                        }
                        RemoteError::Malformed(_) | RemoteError::Unexpected(_) => {
                            self.session.last_request = clock::epoch();
                            self.set_code(StatusCode::MalformedResponse);
                            if new_kind {
                                warn!("{}", err);
                            }
                            self.random_sleep(10.1, 14.0).await;
                        }
                        // Everything else has no in-place recovery and is
                        // re-raised for the visit loop to dispatch.
                        _ => return Err(err.into()),
                    }
                    last_err = Some(err);
                }
            }
        }
        if let Some(err) = last_err {
            return Err(err.into());
        }
        let responses = responses.unwrap_or_default();

        if let Some(pad) = opts.action {
            // Pad for the time the in-game action would take.
            self.session.last_action = self.session.last_request + pad;
        }

        if let Some(delta) = &responses.inventory {
            self.session.inventory_timestamp = delta.new_timestamp_ms;
            let incubate = self.ctx.config.inventory.incubate_eggs;
            self.session.update_inventory(delta, incubate);
        }

        if opts.settings {
            match &responses.settings {
                Some(settings) => {
                    self.ctx.set_settings_hash(settings.hash.clone());
                    if !opts.dl_hash {
                        if let Some(forced) = parse_version(&settings.minimum_client_version) {
                            if forced > SUPPORTED_CLIENT_VERSION {
                                let msg = settings.minimum_client_version.clone();
                                error!(version = %msg, "Client version is being forced, halting");
                                return Err(CallError::VersionForced(msg));
                            }
                        }
                    }
                }
                None => info!("Missing settings response"),
            }
        }

        if let Some(url) = responses.challenge_url.as_deref() {
            if !url.trim().is_empty() {
                self.ctx.captchas_total.fetch_add(1, Ordering::Relaxed);
                if self.ctx.solving_available() {
                    warn!(
                        username = %self.session.account.username,
                        "Encountered a CAPTCHA, trying to solve"
                    );
                    let url = url.to_string();
                    self.handle_captcha(&url).await?;
                } else {
                    return Err(CallError::CaptchaRequired);
                }
            }
        }

        Ok(responses)
    }

    /// Solve a challenge via the external vendor and verify the token.
    ///
    /// Exceeding the per-account attempt ceiling fails fast so the
    /// account is removed from rotation instead of retrying forever.
    pub(crate) fn handle_captcha<'a>(
        &'a mut self,
        challenge_url: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CallError>> + Send + 'a>>
    {
        Box::pin(async move {
        if self.session.captcha_attempts >= self.ctx.config.captcha.allowed_per_account {
            error!(
                username = %self.session.account.username,
                attempts = self.session.captcha_attempts,
                "Too many CAPTCHAs for this account"
            );
            return Err(CallError::CaptchaRequired);
        }
        self.set_code(StatusCode::SolvingCaptcha);
        self.session.captcha_attempts += 1;

        let solver = self
            .ctx
            .solver
            .as_ref()
            .cloned()
            .ok_or(CallError::CaptchaRequired)?;
        let token = match solver.solve(challenge_url).await {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, "CAPTCHA solve attempt failed");
                return Err(CallError::CaptchaSolveFailed);
            }
        };

        // Boxed to cut the call -> handle_captcha -> call cycle.
        let verify: std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<ResponseSet, CallError>> + Send + '_>,
        > = Box::pin(self.call(
            Action::VerifyChallenge { token },
            CallOptions {
                action: Some(4.0),
                ..CallOptions::default()
            },
        ));
        verify.await?;
        self.write_back();
        warn!(username = %self.session.account.username, "Successfully solved CAPTCHA");
        Ok(())
        })
    }

    /// Swap to a different proxy out of turn.
    pub(crate) fn swap_proxy(&mut self) {
        if let Some(proxies) = &self.ctx.proxies {
            let current = self.api.proxy();
            self.api
                .set_proxy(Some(proxies.swap_from(current.as_deref())));
        }
    }
}
