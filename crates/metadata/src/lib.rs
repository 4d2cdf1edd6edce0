use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use common::{
    filename_to_title, path_key, stable_id, AudioTags, DetectedFile, ImageInfo, MediaDetails,
    MediaEntry, MediaKind, Position, VideoInfo, UNKNOWN_ALBUM, UNKNOWN_ARTIST, UNKNOWN_GENRE,
};
use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use tracing::{debug, warn};

#[derive(Debug)]
pub enum MetadataError {
    Io(io::Error),
    Lofty(LoftyError),
    NotFound(String),
    UnknownType(String),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
            MetadataError::NotFound(path) => write!(f, "not found: {}", path),
            MetadataError::UnknownType(path) => write!(f, "unknown content type: {}", path),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<io::Error> for MetadataError {
    fn from(err: io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Turns filesystem paths into catalog entries.
pub trait Extractor {
    /// Cheap classification: attributes and content type, no tag parsing.
    fn detect(&self, path: &Path) -> Result<DetectedFile, MetadataError>;

    /// Full kind-specific parse of a detected file.
    fn extract(&self, file: &DetectedFile) -> Result<MediaEntry, MetadataError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TagExtractor;

impl TagExtractor {
    pub fn new() -> Self {
        TagExtractor
    }
}

impl Extractor for TagExtractor {
    fn detect(&self, path: &Path) -> Result<DetectedFile, MetadataError> {
        let meta = stat(path)?;
        if !meta.is_file() {
            return Err(MetadataError::UnknownType(path_key(path)));
        }
        let content_type = match mime_guess::from_path(path).first() {
            Some(mime) => mime.essence_str().to_string(),
            None => {
                debug!("No content type for {:?}", path);
                return Err(MetadataError::UnknownType(path_key(path)));
            }
        };
        Ok(DetectedFile {
            path: path.to_path_buf(),
            fingerprint: fingerprint(&meta),
            kind: MediaKind::from_content_type(&content_type),
            content_type,
        })
    }

    fn extract(&self, file: &DetectedFile) -> Result<MediaEntry, MetadataError> {
        let path = file.path.as_path();
        let meta = stat(path)?;
        let details = match file.kind {
            MediaKind::Audio => MediaDetails::Audio(read_audio_tags(path)?),
            MediaKind::Video => MediaDetails::Video(VideoInfo {
                title: filename_to_title(path),
                album_path: parent_key(path),
                description: String::new(),
            }),
            MediaKind::Image => MediaDetails::Image(ImageInfo {
                album: path
                    .parent()
                    .and_then(|dir| dir.file_name())
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_else(|| UNKNOWN_ALBUM.to_string()),
                album_path: parent_key(path),
            }),
            MediaKind::Misc | MediaKind::Unknown => MediaDetails::Plain,
        };

        Ok(MediaEntry {
            path: path_key(path),
            fingerprint: file.fingerprint.clone(),
            kind: file.kind,
            content_type: file.content_type.clone(),
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            extension: path
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
                .unwrap_or_default(),
            size: meta.len(),
            created_time: meta.created().map(unix_seconds).unwrap_or(0),
            modified_time: meta.modified().map(unix_seconds).unwrap_or(0),
            details,
        })
    }
}

pub fn read_audio_tags(path: &Path) -> Result<AudioTags, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut tags = AudioTags {
        title: filename_to_title(path),
        ..AudioTags::default()
    };
    let duration_ms = properties.duration().as_millis();
    tags.duration_ms = duration_ms.min(u128::from(u32::MAX)) as u32;

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        if let Some(title) = non_empty(tag.get_string(&ItemKey::TrackTitle)) {
            tags.title = title;
        }
        let album_artist = non_empty(tag.get_string(&ItemKey::AlbumArtist));
        let track_artist = non_empty(tag.get_string(&ItemKey::TrackArtist));
        tags.artist = track_artist
            .clone()
            .or_else(|| album_artist.clone())
            .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
        tags.album_artist = album_artist
            .or(track_artist)
            .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
        tags.album = non_empty(tag.get_string(&ItemKey::AlbumTitle))
            .unwrap_or_else(|| UNKNOWN_ALBUM.to_string());
        tags.genre = tag
            .get_string(&ItemKey::Genre)
            .and_then(first_genre)
            .unwrap_or_else(|| UNKNOWN_GENRE.to_string());

        if let Some(track) = tag.get_string(&ItemKey::TrackNumber).map(parse_position) {
            tags.track = track;
        }
        if tags.track.total == 0 {
            tags.track.total = parse_count(tag.get_string(&ItemKey::TrackTotal));
        }
        if let Some(disc) = tag.get_string(&ItemKey::DiscNumber).map(parse_position) {
            tags.disc = disc;
            if tags.disc.position == 0 {
                tags.disc.position = 1;
            }
        }
        if tags.disc.total == 0 {
            tags.disc.total = parse_count(tag.get_string(&ItemKey::DiscTotal));
        }
        tags.year = tag.get_string(&ItemKey::Year).and_then(parse_year);
    } else {
        debug!("No tags in {:?}; using file name", path);
    }

    Ok(tags)
}

/// Opaque change token built from attributes only.
pub fn fingerprint(meta: &fs::Metadata) -> String {
    let modified = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|dur| dur.as_nanos())
        .unwrap_or(0);
    stable_id(&format!("{}:{}:{}", modified, meta.len(), inode(meta)))
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &fs::Metadata) -> u64 {
    0
}

fn stat(path: &Path) -> Result<fs::Metadata, MetadataError> {
    fs::metadata(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            MetadataError::NotFound(path_key(path))
        } else {
            warn!("Failed to stat {:?}: {}", path, err);
            MetadataError::Io(err)
        }
    })
}

fn parent_key(path: &Path) -> String {
    path.parent().map(path_key).unwrap_or_default()
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs())
        .unwrap_or(0)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Parses "n" or "n/m".
fn parse_position(text: &str) -> Position {
    let mut parts = text.splitn(2, '/');
    let position = parts
        .next()
        .and_then(|head| head.trim().parse().ok())
        .unwrap_or(0);
    let total = parts
        .next()
        .and_then(|tail| tail.trim().parse().ok())
        .unwrap_or(0);
    Position { position, total }
}

fn parse_count(text: Option<&str>) -> u32 {
    text.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn first_genre(text: &str) -> Option<String> {
    text.split(&[';', ',', '/', '|', '\0'][..])
        .map(str::trim)
        .find(|part| !part.is_empty())
        .map(|part| part.to_string())
}
