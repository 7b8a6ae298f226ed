use std::path::Path;

const MAX_TITLE_CHARS: usize = 120;
const FALLBACK_STEM: &str = "download";

/// Client-facing file name: sanitized media title plus the resolved
/// extension. Never derived from the on-disk artifact name.
pub fn download_name(title: Option<&str>, resolved_path: &Path) -> String {
    let stem = title.map(sanitize_title).unwrap_or_default();
    let stem = if stem.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        stem
    };

    let extension = resolved_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string());

    format!("{stem}.{extension}")
}

fn sanitize_title(title: &str) -> String {
    let mut cleaned = String::with_capacity(title.len());
    let mut pending_space = false;

    for character in title.chars() {
        let blocked = character.is_control()
            || matches!(character, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|');
        if blocked || character.is_whitespace() {
            pending_space = !cleaned.is_empty();
            continue;
        }
        if pending_space {
            cleaned.push(' ');
            pending_space = false;
        }
        cleaned.push(character);
    }

    let capped: String = cleaned.chars().take(MAX_TITLE_CHARS).collect();
    capped
        .trim_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string()
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

pub fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn download_name_strips_separators_and_controls() {
        let path = PathBuf::from("/srv/downloads/4f1c.MKV");
        assert_eq!(
            download_name(Some("../../etc/passwd\u{0007} Live: Part 1"), &path),
            "etc passwd Live Part 1.mkv"
        );
    }

    #[test]
    fn download_name_is_capped_and_has_fallbacks() {
        let path = PathBuf::from("artifact");
        assert_eq!(download_name(None, &path), "download.bin");
        assert_eq!(download_name(Some(" /// "), &path), "download.bin");

        let long = "a".repeat(500);
        let name = download_name(Some(&long), &PathBuf::from("x.mp4"));
        assert_eq!(name.len(), MAX_TITLE_CHARS + ".mp4".len());
    }

    #[test]
    fn content_disposition_has_ascii_and_utf8_forms() {
        let header = build_content_disposition("Canción 1.mp3");
        assert_eq!(
            header,
            "attachment; filename=\"Canci_n 1.mp3\"; filename*=UTF-8''Canci%C3%B3n%201.mp3"
        );
        assert_eq!(content_type_for_filename("Canción 1.mp3"), "audio/mpeg");
        assert_eq!(content_type_for_filename("x.unknown"), "application/octet-stream");
    }
}
