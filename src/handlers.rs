use std::net::SocketAddr;

use axum::{
    Json,
    extract::{
        ConnectInfo, Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::{
    admission::Admission,
    app::{AppState, DOWNLOAD_FILENAME_HEADER},
    artifacts::{ArtifactId, ResolvedArtifact, ServedArtifact},
    client_identity::client_identity,
    config::non_empty,
    error::ApiError,
    extraction::{EncodingDescriptor, EncodingKind},
    filename::{build_content_disposition, sanitize_ascii_filename},
};

const MAX_SELECTOR_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
pub struct FormatsRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
pub struct FormatsResponse {
    ok: bool,
    title: String,
    thumbnail: Option<String>,
    webpage_url: String,
    duration_seconds: Option<f64>,
    formats: Vec<EncodingDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    url: String,
    #[serde(default, alias = "formatId")]
    format_id: Option<String>,
    #[serde(default)]
    has_audio: Option<bool>,
    #[serde(default)]
    kind: Option<EncodingKind>,
    #[serde(default)]
    title: Option<String>,
    #[serde(
        default,
        alias = "verificationToken",
        alias = "turnstile_token",
        alias = "cf-turnstile-response"
    )]
    verification_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PreparedResponse {
    ok: bool,
    token: String,
    filename: String,
    size_bytes: u64,
    expires_in_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct VerificationSettings {
    enabled: bool,
    site_key: Option<String>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn verification_settings(State(state): State<AppState>) -> Json<VerificationSettings> {
    Json(VerificationSettings {
        enabled: state.verification.is_enabled(),
        site_key: state.verification.site_key().map(ToString::to_string),
    })
}

pub async fn probe_formats(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<FormatsRequest>, JsonRejection>,
) -> Result<Json<FormatsResponse>, ApiError> {
    let client_ip = client_identity(state.trust_proxy_headers, &headers, addr);
    admit(&state, &client_ip)?;

    let Json(payload) =
        payload.map_err(|rejection| ApiError::invalid_request(rejection.body_text()))?;
    let url = validate_source_url(&payload.url)?;

    let info = state.extractor.probe(&url).await?;
    let formats = info.formats().cloned().collect();

    Ok(Json(FormatsResponse {
        ok: true,
        title: info.title,
        thumbnail: info.thumbnail,
        webpage_url: info.webpage_url,
        duration_seconds: info.duration_seconds,
        formats,
    }))
}

pub async fn download_json(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let client_ip = client_identity(state.trust_proxy_headers, &headers, addr);
    admit(&state, &client_ip)?;

    let Json(payload) =
        payload.map_err(|rejection| ApiError::invalid_request(rejection.body_text()))?;
    let resolved = run_download(&state, &client_ip, payload).await?;
    stream_artifact(&state, &resolved).await
}

pub async fn download_query(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Query<DownloadRequest>, QueryRejection>,
) -> Result<Response, ApiError> {
    let client_ip = client_identity(state.trust_proxy_headers, &headers, addr);
    admit(&state, &client_ip)?;

    let Query(payload) =
        payload.map_err(|rejection| ApiError::invalid_request(rejection.body_text()))?;
    let resolved = run_download(&state, &client_ip, payload).await?;
    stream_artifact(&state, &resolved).await
}

pub async fn prepare_download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Json<PreparedResponse>, ApiError> {
    let client_ip = client_identity(state.trust_proxy_headers, &headers, addr);
    admit(&state, &client_ip)?;

    let Json(payload) =
        payload.map_err(|rejection| ApiError::invalid_request(rejection.body_text()))?;
    let resolved = run_download(&state, &client_ip, payload).await?;

    Ok(Json(PreparedResponse {
        ok: true,
        token: resolved.id.to_string(),
        filename: resolved.download_name,
        size_bytes: resolved.size_bytes,
        expires_in_seconds: state.artifact_retention.as_secs(),
    }))
}

pub async fn serve_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let client_ip = client_identity(state.trust_proxy_headers, &headers, addr);
    admit(&state, &client_ip)?;

    let id = ArtifactId::parse(&token)
        .ok_or_else(|| ApiError::not_found("This download has expired or does not exist."))?;
    let served = state.artifacts.serve(id).await?;
    attachment_response(served)
}

fn admit(state: &AppState, client_ip: &str) -> Result<(), ApiError> {
    match state.admission.admit(client_ip) {
        Admission::Admitted => Ok(()),
        Admission::Rejected {
            retry_after_seconds,
        } => Err(ApiError::rate_limited(retry_after_seconds)),
    }
}

/// Validates the URL and format selector, then verifies the challenge
/// token, then fetches under a concurrency permit and arms expiry. The
/// first failing stage short-circuits; nothing is fetched before the
/// request has passed validation and verification.
async fn run_download(
    state: &AppState,
    client_ip: &str,
    payload: DownloadRequest,
) -> Result<ResolvedArtifact, ApiError> {
    let url = validate_source_url(&payload.url)?;
    let selector = build_selector(&payload)?;

    state
        .verification
        .verify(payload.verification_token.as_deref(), client_ip)
        .await?;

    info!(client_ip, %url, %selector, "starting download");
    let title_hint = payload
        .title
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string);

    // Detached so a client that hangs up mid-download cannot cancel the
    // engine run; the artifact still settles and expires normally.
    let fetch = tokio::spawn(fetch_artifact(state.clone(), url, selector, title_hint));
    fetch.await.map_err(|error| {
        warn!("download task failed: {error}");
        ApiError::internal("The download stopped unexpectedly.")
    })?
}

async fn fetch_artifact(
    state: AppState,
    url: String,
    selector: String,
    title_hint: Option<String>,
) -> Result<ResolvedArtifact, ApiError> {
    let _permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity."))?;

    let id = state.artifacts.allocate();
    let resolved = state
        .artifacts
        .fetch(&state.extractor, &url, &selector, id, title_hint.as_deref())
        .await?;
    state.artifacts.schedule_expiry(id, state.artifact_retention);

    Ok(resolved)
}

async fn stream_artifact(
    state: &AppState,
    resolved: &ResolvedArtifact,
) -> Result<Response, ApiError> {
    let served = state.artifacts.serve(resolved.id).await?;
    attachment_response(served)
}

fn attachment_response(served: ServedArtifact) -> Result<Response, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(served.content_type));
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&served.content_length.to_string())
            .map_err(|_| ApiError::internal("Could not build the download size header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&served.download_name))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(&served.download_name))
            .map_err(|_| ApiError::internal("Could not build the file name header."))?,
    );

    Ok((headers, served.body).into_response())
}

fn validate_source_url(input: &str) -> Result<String, ApiError> {
    let url = input.trim();
    if url.is_empty() {
        return Err(ApiError::invalid_request("Please paste a video URL."));
    }

    let parsed = Url::parse(url)
        .map_err(|_| ApiError::invalid_request("That does not look like a valid URL."))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ApiError::invalid_request(
            "Only http and https links are supported.",
        ));
    }

    Ok(parsed.to_string())
}

/// A video-only choice is paired with the best audio so the merged file
/// has sound.
fn build_selector(payload: &DownloadRequest) -> Result<String, ApiError> {
    let format_id = payload
        .format_id
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::invalid_request("Please choose a format."))?;

    let valid = format_id.len() <= MAX_SELECTOR_CHARS
        && !format_id.starts_with('-')
        && format_id.chars().all(|character| {
            character.is_ascii_alphanumeric()
                || matches!(
                    character,
                    '_' | '-' | '+' | '/' | '.' | '[' | ']' | '<' | '>' | '=' | '*' | ':'
                )
        });
    if !valid {
        return Err(ApiError::invalid_request("That format selection is not valid."));
    }

    let video_only =
        payload.kind == Some(EncodingKind::VideoOnly) || payload.has_audio == Some(false);
    let already_combined = format_id.contains('+') || format_id.contains('/');

    if video_only && !already_combined {
        Ok(format!("{format_id}+bestaudio/best"))
    } else {
        Ok(format_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(format_id: Option<&str>) -> DownloadRequest {
        DownloadRequest {
            url: "https://example.com/watch?v=1".to_string(),
            format_id: format_id.map(ToString::to_string),
            has_audio: None,
            kind: None,
            title: None,
            verification_token: None,
        }
    }

    #[test]
    fn selector_pairs_video_only_with_audio() {
        let mut payload = request(Some("137"));
        assert_eq!(build_selector(&payload).unwrap(), "137");

        payload.kind = Some(EncodingKind::VideoOnly);
        assert_eq!(build_selector(&payload).unwrap(), "137+bestaudio/best");

        payload.kind = None;
        payload.has_audio = Some(false);
        assert_eq!(build_selector(&payload).unwrap(), "137+bestaudio/best");

        payload.format_id = Some("137+140".to_string());
        assert_eq!(build_selector(&payload).unwrap(), "137+140");
    }

    #[test]
    fn selector_rejects_missing_and_option_like_values() {
        assert!(build_selector(&request(None)).is_err());
        assert!(build_selector(&request(Some("  "))).is_err());
        assert!(build_selector(&request(Some("--exec=rm"))).is_err());
        assert!(build_selector(&request(Some("18; rm -rf /"))).is_err());
        assert!(build_selector(&request(Some("bv*[height<=720]+ba/b"))).is_ok());
    }

    #[test]
    fn source_url_must_be_http() {
        assert!(validate_source_url("").is_err());
        assert!(validate_source_url("file:///etc/passwd").is_err());
        assert!(validate_source_url("not a url").is_err());
        assert_eq!(
            validate_source_url("  https://example.com/watch?v=1 ").unwrap(),
            "https://example.com/watch?v=1"
        );
    }

    #[test]
    fn download_request_accepts_camel_case_aliases() {
        let payload: DownloadRequest = serde_json::from_str(
            r#"{"url":"https://example.com/v","formatId":"22","verificationToken":"tok","kind":"video_only"}"#,
        )
        .unwrap();
        assert_eq!(payload.format_id.as_deref(), Some("22"));
        assert_eq!(payload.verification_token.as_deref(), Some("tok"));
        assert_eq!(payload.kind, Some(EncodingKind::VideoOnly));
    }
}
