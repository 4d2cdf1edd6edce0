//! Catalog representation of entries and aggregates.

use common::{AggregateKind, MediaDetails, MediaEntry};
use serde_json::{json, Value};

use crate::catalog::{document_kind, field_str, Document, Query, KIND_FIELD};
use crate::kinds::{
    aggregate_kind, file_kind, groupings, AUDIO_ALBUM_KIND, AUDIO_FILE_KIND, IMAGE_FILE_KIND,
};

pub fn media_document(entry: &MediaEntry) -> Document {
    let mut doc = object(json!({
        "path": entry.path,
        "fingerprint": entry.fingerprint,
        "name": entry.name,
        "extension": entry.extension,
        "contentType": entry.content_type,
        "size": entry.size,
        "createdTime": entry.created_time,
        "modifiedTime": entry.modified_time,
        "searchKey": entry.search_key(),
    }));
    doc.insert(
        KIND_FIELD.to_string(),
        Value::String(file_kind(entry.kind).to_string()),
    );

    let details = match &entry.details {
        MediaDetails::Audio(tags) => json!({
            "title": tags.title,
            "artist": tags.artist,
            "album": tags.album,
            "albumArtist": tags.album_artist,
            "genre": tags.genre,
            "track": { "position": tags.track.position, "total": tags.track.total },
            "disc": { "position": tags.disc.position, "total": tags.disc.total },
            "duration": tags.duration_ms,
            "year": tags.year,
        }),
        MediaDetails::Video(info) => json!({
            "title": info.title,
            "albumPath": info.album_path,
            "description": info.description,
        }),
        MediaDetails::Image(info) => json!({
            "album": info.album,
            "albumPath": info.album_path,
        }),
        MediaDetails::Plain => Value::Null,
    };
    doc.extend(object(details));
    doc
}

/// Fresh aggregate seeded from the member that created it, with zeroed totals.
pub fn aggregate_seed(kind: AggregateKind, member: &Document) -> Document {
    let mut doc = match kind {
        AggregateKind::AudioAlbum => object(json!({
            "name": field_str(member, "album"),
            "albumArtist": field_str(member, "albumArtist"),
            "artist": field_str(member, "artist"),
            "genre": field_str(member, "genre"),
            "total": { "tracks": 0 },
        })),
        AggregateKind::AudioArtist => object(json!({
            "name": field_str(member, "artist"),
            "total": { "tracks": 0, "albums": 0 },
        })),
        AggregateKind::AudioGenre => object(json!({
            "name": field_str(member, "genre"),
            "total": { "tracks": 0, "albums": 0 },
        })),
        AggregateKind::ImageAlbum => object(json!({
            "name": field_str(member, "album"),
            "path": field_str(member, "albumPath"),
            "total": { "images": 0 },
        })),
    };
    doc.insert(
        KIND_FIELD.to_string(),
        Value::String(aggregate_kind(kind).to_string()),
    );
    doc
}

/// Finds the aggregate `member` belongs to by its natural key.
pub fn aggregate_lookup(kind: AggregateKind, member: &Document) -> Query {
    let query = Query::of(aggregate_kind(kind));
    match kind {
        AggregateKind::AudioAlbum => query
            .eq_ignore_case("name", field_str(member, "album"))
            .eq_ignore_case("albumArtist", field_str(member, "albumArtist")),
        AggregateKind::AudioArtist => query.eq_ignore_case("name", field_str(member, "artist")),
        AggregateKind::AudioGenre => query.eq_ignore_case("name", field_str(member, "genre")),
        AggregateKind::ImageAlbum => query.eq("path", field_str(member, "albumPath")),
    }
}

/// Counter name and member query for each total kept on an aggregate.
pub fn member_counts(kind: AggregateKind, aggregate: &Document) -> Vec<(&'static str, Query)> {
    let name = field_str(aggregate, "name");
    match kind {
        AggregateKind::AudioAlbum => vec![(
            "tracks",
            Query::of(AUDIO_FILE_KIND)
                .eq_ignore_case("album", name)
                .eq_ignore_case("albumArtist", field_str(aggregate, "albumArtist")),
        )],
        AggregateKind::AudioArtist => vec![
            (
                "tracks",
                Query::of(AUDIO_FILE_KIND).eq_ignore_case("artist", name),
            ),
            (
                "albums",
                Query::of(AUDIO_ALBUM_KIND).eq_ignore_case("artist", name),
            ),
        ],
        AggregateKind::AudioGenre => vec![
            (
                "tracks",
                Query::of(AUDIO_FILE_KIND).eq_ignore_case("genre", name),
            ),
            (
                "albums",
                Query::of(AUDIO_ALBUM_KIND).eq_ignore_case("genre", name),
            ),
        ],
        AggregateKind::ImageAlbum => vec![(
            "images",
            Query::of(IMAGE_FILE_KIND).eq("albumPath", field_str(aggregate, "path")),
        )],
    }
}

/// Aggregate ids a stored file currently points at.
pub fn memberships(member: &Document) -> Vec<(AggregateKind, String)> {
    let kind = document_kind(member).unwrap_or("");
    groupings(kind)
        .iter()
        .filter_map(|aggregate| {
            member
                .get(aggregate.member_field())
                .and_then(Value::as_str)
                .map(|id| (*aggregate, id.to_string()))
        })
        .collect()
}

pub(crate) fn object(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
