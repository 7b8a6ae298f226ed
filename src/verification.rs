use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::config::{VerificationConfig, non_empty};

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("verification is enabled but no secret key is configured")]
    Misconfigured,
    #[error("verification token missing")]
    TokenMissing,
    #[error("verification service unavailable: {0}")]
    Unavailable(String),
    #[error("verification rejected: {codes:?}")]
    Rejected { codes: Vec<String> },
    #[error("verification issued for unexpected hostname {hostname:?}")]
    HostnameMismatch { hostname: Option<String> },
}

impl VerificationError {
    pub fn message_for_codes(codes: &[String]) -> &'static str {
        if codes.iter().any(|code| code == "timeout-or-duplicate") {
            "Verification expired or was already used. Please complete it again."
        } else if codes.iter().any(|code| code == "invalid-input-response") {
            "Verification token is invalid. Reload the page and retry."
        } else {
            "Verification failed. Reload the page and retry."
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteVerifyResponse {
    pub success: bool,
    #[serde(default, rename = "error-codes")]
    pub error_codes: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Remote challenge validation, e.g. Cloudflare Turnstile `siteverify`.
#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    async fn siteverify(
        &self,
        secret: &str,
        token: &str,
        remote_ip: &str,
    ) -> Result<SiteVerifyResponse, VerificationError>;
}

pub struct TurnstileVerifier {
    http_client: reqwest::Client,
    endpoint: String,
}

impl TurnstileVerifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ChallengeVerifier for TurnstileVerifier {
    async fn siteverify(
        &self,
        secret: &str,
        token: &str,
        remote_ip: &str,
    ) -> Result<SiteVerifyResponse, VerificationError> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .form(&[
                ("secret", secret),
                ("response", token),
                ("remoteip", remote_ip),
            ])
            .send()
            .await
            .map_err(|error| VerificationError::Unavailable(error.to_string()))?;

        if !response.status().is_success() {
            return Err(VerificationError::Unavailable(format!(
                "siteverify returned HTTP {}",
                response.status()
            )));
        }

        response
            .json::<SiteVerifyResponse>()
            .await
            .map_err(|error| VerificationError::Unavailable(error.to_string()))
    }
}

/// Challenge gate in front of the operations that spend resources.
#[derive(Clone)]
pub struct VerificationGate {
    config: VerificationConfig,
    verifier: Arc<dyn ChallengeVerifier>,
}

impl VerificationGate {
    pub fn new(config: VerificationConfig, verifier: Arc<dyn ChallengeVerifier>) -> Self {
        Self { config, verifier }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn site_key(&self) -> Option<&str> {
        self.config.site_key.as_deref()
    }

    pub async fn verify(
        &self,
        token: Option<&str>,
        client_ip: &str,
    ) -> Result<(), VerificationError> {
        if !self.config.enabled {
            return Ok(());
        }

        let Some(secret) = self.config.secret_key.as_deref().and_then(non_empty) else {
            warn!("VERIFICATION_ENABLED=true but TURNSTILE_SECRET_KEY is missing; rejecting");
            return Err(VerificationError::Misconfigured);
        };

        let token = token
            .and_then(non_empty)
            .ok_or(VerificationError::TokenMissing)?;

        let verification = self
            .verifier
            .siteverify(secret, token, client_ip)
            .await
            .inspect_err(|error| warn!("verification request failed: {error}"))?;

        if !verification.success {
            warn!(
                client_ip,
                codes = ?verification.error_codes,
                "verification rejected by provider"
            );
            return Err(VerificationError::Rejected {
                codes: verification.error_codes,
            });
        }

        if !self.config.allowed_hostnames.is_empty() {
            let hostname = verification
                .hostname
                .as_deref()
                .map(str::to_ascii_lowercase);
            let allowed = hostname
                .as_ref()
                .is_some_and(|host| self.config.allowed_hostnames.contains(host));
            if !allowed {
                warn!(client_ip, ?hostname, "verification hostname not in allow-list");
                return Err(VerificationError::HostnameMismatch { hostname });
            }
        }

        Ok(())
    }
}
