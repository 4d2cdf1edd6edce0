use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";
pub const UNKNOWN_GENRE: &str = "Unknown Genre";
pub const UNKNOWN_TITLE: &str = "Unknown Title";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Image,
    Misc,
    #[default]
    Unknown,
}

impl MediaKind {
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.starts_with("audio/") {
            MediaKind::Audio
        } else if content_type.starts_with("video/") {
            MediaKind::Video
        } else if content_type.starts_with("image/") {
            MediaKind::Image
        } else {
            MediaKind::Misc
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Image => "image",
            MediaKind::Misc => "misc",
            MediaKind::Unknown => "unknown",
        }
    }
}

/// Which media kinds a scan should yield.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KindFilter {
    #[default]
    All,
    Only(MediaKind),
}

impl KindFilter {
    pub fn matches(&self, kind: MediaKind) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::Only(wanted) => *wanted == kind,
        }
    }
}

/// A candidate file produced by detection, before any tag parsing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedFile {
    pub path: PathBuf,
    pub fingerprint: String,
    pub content_type: String,
    pub kind: MediaKind,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub position: u32,
    pub total: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioTags {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub genre: String,
    pub track: Position,
    pub disc: Position,
    pub duration_ms: u32,
    pub year: Option<i32>,
}

impl Default for AudioTags {
    fn default() -> Self {
        Self {
            title: UNKNOWN_TITLE.to_string(),
            artist: UNKNOWN_ARTIST.to_string(),
            album: UNKNOWN_ALBUM.to_string(),
            album_artist: UNKNOWN_ARTIST.to_string(),
            genre: UNKNOWN_GENRE.to_string(),
            track: Position::default(),
            disc: Position {
                position: 1,
                total: 0,
            },
            duration_ms: 0,
            year: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    pub album_path: String,
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub album: String,
    pub album_path: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDetails {
    Audio(AudioTags),
    Video(VideoInfo),
    Image(ImageInfo),
    Plain,
}

/// One indexed file. A changed file produces a whole new entry; entries are
/// never patched field by field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub path: String,
    pub fingerprint: String,
    pub kind: MediaKind,
    pub content_type: String,
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub created_time: u64,
    pub modified_time: u64,
    pub details: MediaDetails,
}

impl MediaEntry {
    pub fn audio(&self) -> Option<&AudioTags> {
        match &self.details {
            MediaDetails::Audio(tags) => Some(tags),
            _ => None,
        }
    }

    pub fn image(&self) -> Option<&ImageInfo> {
        match &self.details {
            MediaDetails::Image(info) => Some(info),
            _ => None,
        }
    }

    pub fn search_key(&self) -> String {
        match &self.details {
            MediaDetails::Audio(tags) => {
                format!("{}\t\t{}\t\t{}", tags.artist, tags.album, tags.title)
            }
            MediaDetails::Video(info) => info.title.clone(),
            _ => self.name.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    AudioAlbum,
    AudioArtist,
    AudioGenre,
    ImageAlbum,
}

impl AggregateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::AudioAlbum => "audio album",
            AggregateKind::AudioArtist => "audio artist",
            AggregateKind::AudioGenre => "audio genre",
            AggregateKind::ImageAlbum => "image album",
        }
    }

    /// Field on a media document holding the aggregate's identity.
    pub fn member_field(&self) -> &'static str {
        match self {
            AggregateKind::AudioAlbum | AggregateKind::ImageAlbum => "albumId",
            AggregateKind::AudioArtist => "artistId",
            AggregateKind::AudioGenre => "genreId",
        }
    }
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Catalog key for a filesystem path.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Prefix that matches everything strictly below `dir`, and nothing beside it.
pub fn subtree_prefix(dir: &Path) -> String {
    let mut prefix = path_key(dir);
    if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
        prefix.push(std::path::MAIN_SEPARATOR);
    }
    prefix
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

pub fn is_ignored<'a, I>(path: &Path, ignored: I) -> bool
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    ignored.into_iter().any(|dir| path.starts_with(dir))
}

/// Turns a file name into something that reads like a title.
pub fn filename_to_title(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut out = String::with_capacity(stem.len());
    for ch in stem.chars() {
        match ch {
            '.' | '_' | '(' | ')' | '[' | ']' | '{' | '}' | '\\' => out.push(' '),
            _ => out.push(ch),
        }
    }
    let trimmed = out.trim();
    if trimmed.is_empty() {
        UNKNOWN_TITLE.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("1700000000:120:42");
        let second = stable_id("1700000000:120:42");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("1700000000:121:42"));
    }

    #[test]
    fn classifies_content_types() {
        assert_eq!(MediaKind::from_content_type("audio/mpeg"), MediaKind::Audio);
        assert_eq!(MediaKind::from_content_type("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_content_type("image/jpeg"), MediaKind::Image);
        assert_eq!(MediaKind::from_content_type("text/plain"), MediaKind::Misc);
    }

    #[test]
    fn subtree_prefix_does_not_match_siblings() {
        let prefix = subtree_prefix(Path::new("/media/x"));
        assert!("/media/x/song.mp3".starts_with(&prefix));
        assert!(!"/media/xy/song.mp3".starts_with(&prefix));
        assert_eq!(subtree_prefix(Path::new("/media/x/")), prefix);
    }

    #[test]
    fn ignore_matches_nested_paths() {
        let ignored = vec![PathBuf::from("/media/internal/android")];
        assert!(is_ignored(Path::new("/media/internal/android"), &ignored));
        assert!(is_ignored(Path::new("/media/internal/android/a.mp3"), &ignored));
        assert!(!is_ignored(Path::new("/media/internal/androids"), &ignored));
    }

    #[test]
    fn filename_becomes_title() {
        assert_eq!(
            filename_to_title(Path::new("/m/My_Holiday.(2014).mp4")),
            "My Holiday  2014"
        );
        assert_eq!(filename_to_title(Path::new("/m/.mp4")), "mp4");
        assert_eq!(filename_to_title(Path::new("/m/__.txt")), UNKNOWN_TITLE);
    }

    #[test]
    fn search_key_depends_on_kind() {
        let mut entry = MediaEntry {
            path: "/m/a.mp3".to_string(),
            fingerprint: "f".to_string(),
            kind: MediaKind::Audio,
            content_type: "audio/mpeg".to_string(),
            name: "a.mp3".to_string(),
            extension: "mp3".to_string(),
            size: 1,
            created_time: 0,
            modified_time: 0,
            details: MediaDetails::Audio(AudioTags {
                title: "Song".to_string(),
                artist: "Band".to_string(),
                album: "Record".to_string(),
                ..AudioTags::default()
            }),
        };
        assert_eq!(entry.search_key(), "Band\t\tRecord\t\tSong");
        entry.details = MediaDetails::Plain;
        assert_eq!(entry.search_key(), "a.mp3");
    }
}
