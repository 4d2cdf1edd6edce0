use tracing::{info, warn};

use crate::catalog::{document_id, CatalogRequest, CatalogResponse, KindDefinition, Query};
use crate::fingerprints::FingerprintStore;
use crate::kinds::{
    definitions, AUDIO_ALBUM_KIND, AUDIO_ARTIST_KIND, AUDIO_GENRE_KIND, FILE_KIND,
    IMAGE_ALBUM_KIND,
};
use crate::queue::{Command, CommandContext, CommandError};

const WIPED_KINDS: [&str; 5] = [
    FILE_KIND,
    AUDIO_ALBUM_KIND,
    AUDIO_ARTIST_KIND,
    AUDIO_GENRE_KIND,
    IMAGE_ALBUM_KIND,
];

/// Deletes every file and aggregate document, one kind at a time.
pub struct RemoveAll {
    next: usize,
    deleting: bool,
}

impl RemoveAll {
    pub fn new() -> Self {
        Self {
            next: 0,
            deleting: false,
        }
    }

    fn find_next(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        match WIPED_KINDS.get(self.next) {
            Some(kind) => {
                self.deleting = false;
                ctx.request(CatalogRequest::Find(Query::of(kind)))
            }
            None => {
                ctx.finish();
                Ok(())
            }
        }
    }
}

impl Default for RemoveAll {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for RemoveAll {
    fn kind(&self) -> &'static str {
        "RemoveAll"
    }

    fn subject(&self) -> String {
        WIPED_KINDS.get(self.next).unwrap_or(&"done").to_string()
    }

    fn execute(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        self.find_next(ctx)
    }

    fn on_response(
        &mut self,
        response: CatalogResponse,
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), CommandError> {
        if self.deleting {
            response.expect_write()?;
            self.next += 1;
            return self.find_next(ctx);
        }
        let ids: Vec<String> = response
            .into_found()?
            .iter()
            .filter_map(document_id)
            .map(|id| id.to_string())
            .collect();
        if ids.is_empty() {
            self.next += 1;
            return self.find_next(ctx);
        }
        info!("Wiping {} documents of {}", ids.len(), WIPED_KINDS[self.next]);
        self.deleting = true;
        ctx.request(CatalogRequest::Delete(ids))
    }
}

/// Registers one kind definition.
pub struct PutKind {
    definition: KindDefinition,
}

impl PutKind {
    pub fn new(definition: KindDefinition) -> Self {
        Self { definition }
    }
}

impl Command for PutKind {
    fn kind(&self) -> &'static str {
        "PutKind"
    }

    fn subject(&self) -> String {
        self.definition.name.clone()
    }

    fn execute(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        ctx.request(CatalogRequest::PutKind(self.definition.clone()))
    }

    fn on_response(
        &mut self,
        response: CatalogResponse,
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), CommandError> {
        response.expect_write()?;
        ctx.finish();
        Ok(())
    }
}

/// Drops one kind definition along with its documents.
pub struct RemoveKind {
    name: String,
}

impl RemoveKind {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Command for RemoveKind {
    fn kind(&self) -> &'static str {
        "RemoveKind"
    }

    fn subject(&self) -> String {
        self.name.clone()
    }

    fn execute(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        ctx.request(CatalogRequest::DelKind(self.name.clone()))
    }

    fn on_response(
        &mut self,
        response: CatalogResponse,
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), CommandError> {
        response.expect_write()?;
        ctx.finish();
        Ok(())
    }
}

/// Persists the schema version once the kinds are in place. Touches no
/// catalog state.
pub struct RecordSchemaVersion {
    fingerprints: FingerprintStore,
    version: u32,
}

impl RecordSchemaVersion {
    pub fn new(fingerprints: FingerprintStore, version: u32) -> Self {
        Self {
            fingerprints,
            version,
        }
    }
}

impl Command for RecordSchemaVersion {
    fn kind(&self) -> &'static str {
        "RecordSchemaVersion"
    }

    fn subject(&self) -> String {
        self.version.to_string()
    }

    fn execute(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        self.fingerprints.set_schema_version(self.version)?;
        info!("Catalog schema {} installed", self.version);
        ctx.finish();
        Ok(())
    }

    fn on_failure(&mut self, error: &CommandError) {
        warn!(
            "Schema {} not recorded ({}); the next start rebuilds again",
            self.version, error
        );
    }
}

/// Wipe, unregister (derived kinds first), register (bases first), then
/// record the version.
pub fn rebuild_sequence(fingerprints: FingerprintStore, version: u32) -> Vec<Box<dyn Command>> {
    let definitions = definitions();
    let mut sequence: Vec<Box<dyn Command>> = vec![Box::new(RemoveAll::new())];
    for definition in definitions.iter().rev() {
        sequence.push(Box::new(RemoveKind::new(&definition.name)));
    }
    for definition in definitions {
        sequence.push(Box::new(PutKind::new(definition)));
    }
    sequence.push(Box::new(RecordSchemaVersion::new(fingerprints, version)));
    sequence
}
