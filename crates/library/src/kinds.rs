use common::{AggregateKind, MediaKind};

use crate::catalog::KindDefinition;

pub const FILE_KIND: &str = "media.file";
pub const AUDIO_FILE_KIND: &str = "media.audio.file";
pub const VIDEO_FILE_KIND: &str = "media.video.file";
pub const IMAGE_FILE_KIND: &str = "media.image.file";
pub const MISC_FILE_KIND: &str = "media.misc.file";

pub const AUDIO_ALBUM_KIND: &str = "media.audio.album";
pub const AUDIO_ARTIST_KIND: &str = "media.audio.artist";
pub const AUDIO_GENRE_KIND: &str = "media.audio.genre";
pub const IMAGE_ALBUM_KIND: &str = "media.image.album";

pub fn file_kind(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => AUDIO_FILE_KIND,
        MediaKind::Video => VIDEO_FILE_KIND,
        MediaKind::Image => IMAGE_FILE_KIND,
        MediaKind::Misc | MediaKind::Unknown => MISC_FILE_KIND,
    }
}

pub fn aggregate_kind(kind: AggregateKind) -> &'static str {
    match kind {
        AggregateKind::AudioAlbum => AUDIO_ALBUM_KIND,
        AggregateKind::AudioArtist => AUDIO_ARTIST_KIND,
        AggregateKind::AudioGenre => AUDIO_GENRE_KIND,
        AggregateKind::ImageAlbum => IMAGE_ALBUM_KIND,
    }
}

/// Aggregates a stored file of this catalog kind belongs to, in the order
/// they are maintained.
pub fn groupings(file_kind: &str) -> &'static [AggregateKind] {
    match file_kind {
        AUDIO_FILE_KIND => &[
            AggregateKind::AudioAlbum,
            AggregateKind::AudioArtist,
            AggregateKind::AudioGenre,
        ],
        IMAGE_FILE_KIND => &[AggregateKind::ImageAlbum],
        _ => &[],
    }
}

/// Every kind the catalog needs, bases before the kinds extending them.
pub fn definitions() -> Vec<KindDefinition> {
    vec![
        KindDefinition::new(FILE_KIND, None),
        KindDefinition::new(AUDIO_FILE_KIND, Some(FILE_KIND)),
        KindDefinition::new(VIDEO_FILE_KIND, Some(FILE_KIND)),
        KindDefinition::new(IMAGE_FILE_KIND, Some(FILE_KIND)),
        KindDefinition::new(MISC_FILE_KIND, Some(FILE_KIND)),
        KindDefinition::new(AUDIO_ALBUM_KIND, None),
        KindDefinition::new(AUDIO_ARTIST_KIND, None),
        KindDefinition::new(AUDIO_GENRE_KIND, None),
        KindDefinition::new(IMAGE_ALBUM_KIND, None),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bases_come_first() {
        let defs = definitions();
        for (index, def) in defs.iter().enumerate() {
            if let Some(base) = &def.extends {
                let base_index = defs.iter().position(|d| &d.name == base).unwrap();
                assert!(base_index < index, "{} registered before its base", def.name);
            }
        }
    }

    #[test]
    fn only_audio_and_images_are_grouped() {
        assert_eq!(groupings(file_kind(MediaKind::Audio)).len(), 3);
        assert_eq!(
            groupings(file_kind(MediaKind::Image)),
            &[AggregateKind::ImageAlbum]
        );
        assert!(groupings(file_kind(MediaKind::Video)).is_empty());
        assert!(groupings(file_kind(MediaKind::Misc)).is_empty());
    }
}
