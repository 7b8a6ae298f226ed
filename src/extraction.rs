//! Probing and fetching through the media engine, with the engine's loose
//! metadata normalized into display-ready encoding groups.

use std::{cmp::Ordering, collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{EngineError, FetchJob, FetchReport, MediaEngine, RawFormat, RawMediaInfo};

const MAX_FORMATS_PER_GROUP: usize = 200;

/// Phrases the engine emits when a source wants a login or an anti-bot
/// challenge. Matched case-insensitively against the engine's error text.
pub const DEFAULT_RESTRICTED_PHRASES: &[&str] = &[
    "sign in to confirm",
    "confirm you're not a bot",
    "login required",
    "requires authentication",
    "authentication required",
    "private video",
    "members-only",
    "use --cookies",
    "--cookies-from-browser",
];

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("source requires authentication or a bot challenge: {detail}")]
    Restricted { detail: String },
    #[error("engine timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("extraction failed: {detail}")]
    Generic { detail: String },
}

impl ExtractionError {
    pub fn is_restricted(&self) -> bool {
        matches!(self, Self::Restricted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    Progressive,
    VideoOnly,
    AudioOnly,
}

impl EncodingKind {
    /// `None` when both tracks are absent; such entries are not downloadable.
    pub fn classify(vcodec: Option<&str>, acodec: Option<&str>) -> Option<Self> {
        let has_video = vcodec != Some("none");
        let has_audio = acodec != Some("none");
        match (has_video, has_audio) {
            (true, true) => Some(Self::Progressive),
            (true, false) => Some(Self::VideoOnly),
            (false, true) => Some(Self::AudioOnly),
            (false, false) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EncodingDescriptor {
    pub format_id: String,
    pub kind: EncodingKind,
    pub label: String,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub tbr: Option<f64>,
    pub vbr: Option<f64>,
    pub abr: Option<f64>,
    pub filesize_bytes: Option<u64>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub title: String,
    pub thumbnail: Option<String>,
    pub webpage_url: String,
    pub duration_seconds: Option<f64>,
    pub progressive: Vec<EncodingDescriptor>,
    pub video_only: Vec<EncodingDescriptor>,
    pub audio_only: Vec<EncodingDescriptor>,
}

impl MediaInfo {
    /// All groups in preference order: progressive, video-only, audio-only.
    pub fn formats(&self) -> impl Iterator<Item = &EncodingDescriptor> {
        self.progressive
            .iter()
            .chain(self.video_only.iter())
            .chain(self.audio_only.iter())
    }
}

#[derive(Debug, Clone)]
pub struct RestrictedPhrases {
    phrases: Vec<String>,
}

impl Default for RestrictedPhrases {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl RestrictedPhrases {
    pub fn new(extra: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let mut phrases = DEFAULT_RESTRICTED_PHRASES
            .iter()
            .map(|phrase| normalize_error_text(phrase))
            .collect::<Vec<_>>();
        for phrase in extra {
            let phrase = normalize_error_text(phrase.as_ref());
            if !phrase.is_empty() && !phrases.contains(&phrase) {
                phrases.push(phrase);
            }
        }
        Self { phrases }
    }

    pub fn matches(&self, error_text: &str) -> bool {
        let haystack = normalize_error_text(error_text);
        self.phrases.iter().any(|phrase| haystack.contains(phrase))
    }
}

fn normalize_error_text(value: &str) -> String {
    value.trim().replace(['\u{2019}', '\u{2018}'], "'").to_lowercase()
}

pub struct Extractor {
    engine: Arc<dyn MediaEngine>,
    restricted: RestrictedPhrases,
}

impl Extractor {
    pub fn new(engine: Arc<dyn MediaEngine>, restricted: RestrictedPhrases) -> Self {
        Self { engine, restricted }
    }

    pub async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractionError> {
        let raw = self
            .engine
            .probe(url)
            .await
            .map_err(|error| self.classify(error))?;
        let info = normalize_media_info(raw, url)?;
        info!(
            url,
            progressive = info.progressive.len(),
            video_only = info.video_only.len(),
            audio_only = info.audio_only.len(),
            "probed media"
        );
        Ok(info)
    }

    pub async fn fetch(&self, job: &FetchJob) -> Result<FetchReport, ExtractionError> {
        self.engine
            .fetch(job)
            .await
            .map_err(|error| self.classify(error))
    }

    pub fn classify(&self, error: EngineError) -> ExtractionError {
        match error {
            EngineError::Failed { message } if self.restricted.matches(&message) => {
                info!("source refused automated access: {message}");
                ExtractionError::Restricted { detail: message }
            }
            EngineError::Failed { message } => {
                warn!("engine failed: {message}");
                ExtractionError::Generic { detail: message }
            }
            EngineError::TimedOut { seconds } => {
                warn!("engine timed out after {seconds}s");
                ExtractionError::Timeout { seconds }
            }
            other => {
                warn!("engine unavailable: {other}");
                ExtractionError::Generic {
                    detail: other.to_string(),
                }
            }
        }
    }
}

/// Picks the single item to work on. A playlist-shaped answer collapses to
/// its first entry that carries formats.
fn select_target(raw: RawMediaInfo) -> Result<(RawMediaInfo, Option<String>), ExtractionError> {
    let is_playlist = matches!(raw.kind.as_deref(), Some("playlist" | "multi_video"))
        || (raw.formats.is_empty() && !raw.entries.is_empty());
    if !is_playlist {
        return Ok((raw, None));
    }

    let playlist_title = raw.title.clone();
    raw.entries
        .into_iter()
        .flatten()
        .find(|entry| !entry.formats.is_empty())
        .map(|entry| (entry, playlist_title))
        .ok_or_else(|| ExtractionError::Generic {
            detail: "playlist contains no downloadable entries".to_string(),
        })
}

pub fn normalize_media_info(
    raw: RawMediaInfo,
    requested_url: &str,
) -> Result<MediaInfo, ExtractionError> {
    let (target, playlist_title) = select_target(raw)?;

    let mut progressive = Vec::new();
    let mut video_only = Vec::new();
    let mut audio_only = Vec::new();
    let mut seen_ids = HashSet::new();

    for format in &target.formats {
        let Some(descriptor) = describe_format(format) else {
            continue;
        };
        if !seen_ids.insert(descriptor.format_id.clone()) {
            continue;
        }
        match descriptor.kind {
            EncodingKind::Progressive => progressive.push(descriptor),
            EncodingKind::VideoOnly => video_only.push(descriptor),
            EncodingKind::AudioOnly => audio_only.push(descriptor),
        }
    }

    sort_video_group(&mut progressive);
    sort_video_group(&mut video_only);
    sort_audio_group(&mut audio_only);
    for group in [&mut progressive, &mut video_only, &mut audio_only] {
        group.truncate(MAX_FORMATS_PER_GROUP);
    }

    let title = target
        .title
        .filter(|value| !value.trim().is_empty())
        .or(playlist_title.filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| "Video".to_string());

    Ok(MediaInfo {
        title,
        thumbnail: target.thumbnail,
        webpage_url: target
            .webpage_url
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| requested_url.to_string()),
        duration_seconds: target.duration.filter(|value| *value > 0.0),
        progressive,
        video_only,
        audio_only,
    })
}

fn describe_format(format: &RawFormat) -> Option<EncodingDescriptor> {
    format.url.as_deref().filter(|url| !url.trim().is_empty())?;
    let format_id = format
        .format_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())?
        .to_string();
    let kind = EncodingKind::classify(format.vcodec.as_deref(), format.acodec.as_deref())?;

    let positive = |value: Option<f64>| value.filter(|number| *number > 0.0);
    let codec = |value: &Option<String>| {
        value
            .as_deref()
            .filter(|codec| *codec != "none" && !codec.trim().is_empty())
            .map(ToString::to_string)
    };

    let mut descriptor = EncodingDescriptor {
        format_id,
        kind,
        label: String::new(),
        ext: format
            .ext
            .as_deref()
            .filter(|ext| !ext.trim().is_empty())
            .map(str::to_ascii_lowercase),
        vcodec: codec(&format.vcodec),
        acodec: codec(&format.acodec),
        height: format.height.filter(|height| *height > 0),
        fps: positive(format.fps),
        tbr: positive(format.tbr),
        vbr: positive(format.vbr),
        abr: positive(format.abr),
        filesize_bytes: positive(format.filesize.or(format.filesize_approx))
            .map(|bytes| bytes.round() as u64),
        note: format
            .format_note
            .as_deref()
            .filter(|note| !note.trim().is_empty())
            .map(ToString::to_string),
    };
    descriptor.label = build_label(&descriptor);
    Some(descriptor)
}

fn build_label(descriptor: &EncodingDescriptor) -> String {
    let ext = descriptor
        .ext
        .as_deref()
        .unwrap_or("auto")
        .to_ascii_uppercase();
    let size_label = descriptor
        .filesize_bytes
        .map(format_filesize)
        .unwrap_or_else(|| "size unknown".to_string());

    match descriptor.kind {
        EncodingKind::AudioOnly => {
            let bitrate_label = descriptor
                .abr
                .or(descriptor.tbr)
                .map(|bitrate| format!("{} kbps", bitrate.round() as u32))
                .unwrap_or_else(|| "variable bitrate".to_string());
            format!("Audio · {ext} · {bitrate_label} · {size_label}")
        }
        EncodingKind::Progressive | EncodingKind::VideoOnly => {
            let resolution = descriptor
                .height
                .map(|height| format!("{height}p"))
                .or_else(|| descriptor.note.clone())
                .unwrap_or_else(|| "Video".to_string());
            let fps_label = descriptor
                .fps
                .map(|fps| format!("{}fps", fps.round() as u32))
                .unwrap_or_else(|| "variable fps".to_string());
            let audio_label = if descriptor.kind == EncodingKind::Progressive {
                "with audio"
            } else {
                "no audio"
            };
            format!("{resolution} · {ext} · {fps_label} · {size_label} · {audio_label}")
        }
    }
}

fn sort_video_group(group: &mut [EncodingDescriptor]) {
    group.sort_by(|a, b| {
        b.height
            .unwrap_or_default()
            .cmp(&a.height.unwrap_or_default())
            .then_with(|| compare_desc(a.tbr, b.tbr))
    });
}

fn sort_audio_group(group: &mut [EncodingDescriptor]) {
    group.sort_by(|a, b| compare_desc(a.abr, b.abr).then_with(|| compare_desc(a.tbr, b.tbr)));
}

fn compare_desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    b.unwrap_or_default()
        .partial_cmp(&a.unwrap_or_default())
        .unwrap_or(Ordering::Equal)
}

fn format_filesize(bytes: u64) -> String {
    let mb = bytes as f64 / 1_048_576.0;
    if mb > 1024.0 {
        format!("{:.2} GB", mb / 1024.0)
    } else {
        format!("{mb:.1} MB")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(id: &str, vcodec: &str, acodec: &str) -> RawFormat {
        RawFormat {
            format_id: Some(id.to_string()),
            url: Some(format!("https://cdn.example.com/{id}")),
            ext: Some("mp4".to_string()),
            vcodec: Some(vcodec.to_string()),
            acodec: Some(acodec.to_string()),
            ..RawFormat::default()
        }
    }

    fn video(id: &str, vcodec: &str, acodec: &str, height: u32, tbr: f64) -> RawFormat {
        RawFormat {
            height: Some(height),
            tbr: Some(tbr),
            ..format(id, vcodec, acodec)
        }
    }

    fn audio(id: &str, abr: f64) -> RawFormat {
        RawFormat {
            abr: Some(abr),
            ext: Some("m4a".to_string()),
            ..format(id, "none", "mp4a.40.2")
        }
    }

    #[test]
    fn classification_follows_codec_tags() {
        assert_eq!(
            EncodingKind::classify(Some("none"), Some("aac")),
            Some(EncodingKind::AudioOnly)
        );
        assert_eq!(
            EncodingKind::classify(Some("avc1"), Some("none")),
            Some(EncodingKind::VideoOnly)
        );
        assert_eq!(
            EncodingKind::classify(Some("avc1"), Some("aac")),
            Some(EncodingKind::Progressive)
        );
        assert_eq!(EncodingKind::classify(Some("none"), Some("none")), None);
    }

    #[test]
    fn groups_are_sorted_and_filtered() {
        let raw = RawMediaInfo {
            title: Some("Clip".to_string()),
            formats: vec![
                video("low", "avc1", "aac", 360, 500.0),
                video("hd-a", "avc1", "aac", 720, 1_500.0),
                video("hd-b", "avc1", "aac", 720, 2_500.0),
                video("vo", "vp9", "none", 1080, 4_000.0),
                audio("a-low", 64.0),
                audio("a-high", 160.0),
                format("sb0", "none", "none"),
                RawFormat {
                    url: None,
                    ..format("no-url", "avc1", "aac")
                },
                RawFormat {
                    format_id: Some("  ".to_string()),
                    ..format("blank", "avc1", "aac")
                },
            ],
            ..RawMediaInfo::default()
        };

        let info = normalize_media_info(raw, "https://example.com/watch").unwrap();
        fn ids(group: &[EncodingDescriptor]) -> Vec<&str> {
            group
                .iter()
                .map(|descriptor| descriptor.format_id.as_str())
                .collect()
        }

        assert_eq!(ids(&info.progressive), vec!["hd-b", "hd-a", "low"]);
        assert_eq!(ids(&info.video_only), vec!["vo"]);
        assert_eq!(ids(&info.audio_only), vec!["a-high", "a-low"]);
        assert_eq!(info.formats().count(), 6);
        assert!(info.formats().all(|descriptor| !descriptor.format_id.is_empty()));
        assert_eq!(info.webpage_url, "https://example.com/watch");
    }

    #[test]
    fn missing_numbers_stay_absent_and_sort_last() {
        let raw = RawMediaInfo {
            formats: vec![
                format("unknown", "avc1", "aac"),
                video("sd", "avc1", "aac", 480, 900.0),
            ],
            ..RawMediaInfo::default()
        };

        let info = normalize_media_info(raw, "https://example.com/v").unwrap();
        assert_eq!(info.title, "Video");
        assert_eq!(info.progressive[0].format_id, "sd");
        let unknown = &info.progressive[1];
        assert_eq!(unknown.height, None);
        assert_eq!(unknown.tbr, None);
        assert_eq!(unknown.filesize_bytes, None);
        assert!(unknown.label.contains("size unknown"));
    }

    #[test]
    fn duplicate_ids_keep_first_occurrence() {
        let raw = RawMediaInfo {
            formats: vec![
                video("18", "avc1", "aac", 360, 600.0),
                video("18", "avc1", "aac", 1080, 9_000.0),
            ],
            ..RawMediaInfo::default()
        };
        let info = normalize_media_info(raw, "https://example.com/v").unwrap();
        assert_eq!(info.progressive.len(), 1);
        assert_eq!(info.progressive[0].height, Some(360));
    }

    #[test]
    fn playlist_collapses_to_first_entry_with_formats() {
        let raw = RawMediaInfo {
            kind: Some("playlist".to_string()),
            title: Some("Mix".to_string()),
            entries: vec![
                None,
                Some(RawMediaInfo::default()),
                Some(RawMediaInfo {
                    title: Some("Second".to_string()),
                    webpage_url: Some("https://example.com/second".to_string()),
                    formats: vec![video("22", "avc1", "aac", 720, 1_000.0)],
                    ..RawMediaInfo::default()
                }),
            ],
            ..RawMediaInfo::default()
        };

        let info = normalize_media_info(raw, "https://example.com/list").unwrap();
        assert_eq!(info.title, "Second");
        assert_eq!(info.webpage_url, "https://example.com/second");
        assert_eq!(info.progressive.len(), 1);
    }

    #[test]
    fn empty_playlist_is_generic_error() {
        let raw = RawMediaInfo {
            kind: Some("playlist".to_string()),
            entries: vec![None],
            ..RawMediaInfo::default()
        };
        let error = normalize_media_info(raw, "https://example.com/list").unwrap_err();
        assert!(matches!(error, ExtractionError::Generic { .. }));
    }

    #[test]
    fn restricted_phrases_match_curly_apostrophes_and_extras() {
        let phrases = RestrictedPhrases::new(["Geo Blocked"]);
        assert!(phrases.matches("ERROR: Sign in to confirm you’re not a bot"));
        assert!(phrases.matches("ERROR: this video is geo blocked"));
        assert!(!phrases.matches("ERROR: Unsupported URL: https://example.com"));
    }

    #[test]
    fn labels_describe_tracks() {
        let raw = RawMediaInfo {
            formats: vec![
                RawFormat {
                    fps: Some(29.97),
                    filesize: Some(5.0 * 1_048_576.0),
                    ..video("137", "avc1", "none", 1080, 4_000.0)
                },
                audio("140", 129.5),
            ],
            ..RawMediaInfo::default()
        };
        let info = normalize_media_info(raw, "https://example.com/v").unwrap();
        assert_eq!(
            info.video_only[0].label,
            "1080p · MP4 · 30fps · 5.0 MB · no audio"
        );
        assert_eq!(info.audio_only[0].label, "Audio · M4A · 130 kbps · size unknown");
    }
}
