//! Media file filtering and TV filename parsing helpers.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::BatchKey;

/// Shared media extension defaults.
///
/// Keeping the extension list in one place allows the server to expose a user
/// facing configuration later without diverging from the core's filtering
/// rules.
pub const DEFAULT_MEDIA_FILE_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "webm", "flv", "wmv", "m4v", "mpg", "mpeg",
];

/// Convenience helper for consumers that work with owned strings (e.g. config
/// deserialisation layers).
pub fn default_media_file_extensions_vec() -> Vec<String> {
    DEFAULT_MEDIA_FILE_EXTENSIONS
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

/// Whether `path` names a media file under the configured extension set.
pub fn is_media_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

static EPISODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[Ss](\d{1,2})[Ee]\d{1,3}").expect("static episode pattern"));

static SEASON_FOLDER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:season\s*|s)(\d{1,2})$").expect("static season pattern"));

/// Parse a series/season batch key out of a destination path.
///
/// Handles the two layouts the management tools produce: a season folder
/// (`.../Show Name/Season 02`) and an episode filename
/// (`.../Show Name/Show.Name.S02E05.mkv`). Returns `None` when neither shape
/// matches; callers treat that as "no batch identity", not an error.
pub fn parse_batch_key(path: &Path) -> Option<BatchKey> {
    let last = path.file_name()?.to_str()?;

    if let Some(caps) = SEASON_FOLDER_PATTERN.captures(last) {
        let season: u32 = caps.get(1)?.as_str().parse().ok()?;
        let series = clean_title(path.parent()?.file_name()?.to_str()?)?;
        return Some(BatchKey::new(series, season));
    }

    if let Some(m) = EPISODE_PATTERN.captures(last) {
        let season: u32 = m.get(1)?.as_str().parse().ok()?;
        let whole = m.get(0)?;
        // Prefer the title text preceding the SxxEyy marker; fall back to the
        // parent folder when the filename starts with the marker.
        let prefix = clean_title(&last[..whole.start()]);
        let series = match prefix {
            Some(series) => series,
            None => clean_title(path.parent()?.file_name()?.to_str()?)?,
        };
        return Some(BatchKey::new(series, season));
    }

    None
}

/// Normalize a title fragment: separators to spaces, trimmed, empty → None.
fn clean_title(raw: &str) -> Option<String> {
    let cleaned = raw
        .replace(['.', '_'], " ")
        .trim_matches(|c: char| c.is_whitespace() || c == '-')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if cleaned.is_empty() { None } else { Some(cleaned) }
}
