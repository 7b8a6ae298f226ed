use std::{collections::HashSet, sync::Arc, time::Duration};

use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION},
    routing::{get, post},
};
use tokio::sync::Semaphore;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    admission::AdmissionGate,
    artifacts::ArtifactManager,
    config::Config,
    engine::MediaEngine,
    extraction::{Extractor, RestrictedPhrases},
    handlers,
    verification::{ChallengeVerifier, VerificationGate},
};

pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionGate>,
    pub verification: VerificationGate,
    pub extractor: Arc<Extractor>,
    pub artifacts: Arc<ArtifactManager>,
    pub download_semaphore: Arc<Semaphore>,
    pub trust_proxy_headers: bool,
    pub artifact_retention: Duration,
}

impl AppState {
    pub fn new(
        config: &Config,
        engine: Arc<dyn MediaEngine>,
        verifier: Arc<dyn ChallengeVerifier>,
    ) -> Self {
        Self {
            admission: Arc::new(AdmissionGate::new(&config.rate_limit)),
            verification: VerificationGate::new(config.verification.clone(), verifier),
            extractor: Arc::new(Extractor::new(
                engine,
                RestrictedPhrases::new(&config.extra_restricted_phrases),
            )),
            artifacts: Arc::new(ArtifactManager::new(
                config.artifact_dir.clone(),
                config.max_artifact_bytes,
            )),
            download_semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            trust_proxy_headers: config.trust_proxy_headers,
            artifact_retention: config.artifact_retention,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/verification", get(handlers::verification_settings))
        .route("/api/formats", post(handlers::probe_formats))
        .route(
            "/api/download",
            get(handlers::download_query).post(handlers::download_json),
        )
        .route("/api/prepare", post(handlers::prepare_download))
        .route("/api/file/{token}", get(handlers::serve_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, thiserror::Error)]
#[error("invalid origin in ALLOWED_ORIGINS: {0}; use values like https://example.com")]
pub struct InvalidOrigin(pub String);

/// CORS for the browser front-end. Only the exact configured origins may
/// read responses, including the download file name headers.
pub fn build_cors_layer(allowed: &[String]) -> Result<CorsLayer, InvalidOrigin> {
    let origins = allowed
        .iter()
        .map(|origin| normalize_origin(origin).ok_or_else(|| InvalidOrigin(origin.clone())))
        .collect::<Result<HashSet<_>, _>>()?;
    if origins.is_empty() {
        warn!("no CORS origins configured; cross-origin requests will be refused");
    }
    info!(count = origins.len(), ?origins, "CORS allow-list loaded");

    let origins = Arc::new(origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let allowed = origin
            .to_str()
            .ok()
            .and_then(normalize_origin)
            .is_some_and(|origin| origins.contains(&origin));
        debug!(?origin, allowed, "CORS origin check");
        allowed
    });

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]))
}

/// Canonical `scheme://host[:port]` form; anything with a path, query or
/// fragment is not an origin.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value.trim()).ok()?;
    let bare = parsed.path() == "/" && parsed.query().is_none() && parsed.fragment().is_none();
    if !bare || !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    Some(parsed.origin().ascii_serialization())
}
