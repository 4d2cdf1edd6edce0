use common::MediaEntry;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{enqueue_recounts, FindOrCreateAggregate};
use crate::catalog::{document_id, CatalogRequest, CatalogResponse, Document, Query, ID_FIELD};
use crate::fingerprints::FingerprintStore;
use crate::kinds::{file_kind, groupings, FILE_KIND};
use crate::queue::{Command, CommandContext, CommandError};
use crate::serializer::{media_document, memberships};

enum InsertStep {
    Lookup,
    Store { previous: Option<Document> },
}

/// Stores an entry, replacing any earlier revision of the same path, then
/// schedules aggregate maintenance for it.
pub struct Insert {
    entry: MediaEntry,
    fingerprints: FingerprintStore,
    document: Document,
    step: InsertStep,
}

impl Insert {
    pub fn new(entry: MediaEntry, fingerprints: FingerprintStore) -> Self {
        let document = media_document(&entry);
        Self {
            entry,
            fingerprints,
            document,
            step: InsertStep::Lookup,
        }
    }
}

impl Command for Insert {
    fn kind(&self) -> &'static str {
        "Insert"
    }

    fn subject(&self) -> String {
        self.entry.path.clone()
    }

    fn execute(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        ctx.request(CatalogRequest::Find(
            Query::of(FILE_KIND).eq("path", self.entry.path.as_str()),
        ))
    }

    fn on_response(
        &mut self,
        response: CatalogResponse,
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), CommandError> {
        match &mut self.step {
            InsertStep::Lookup => {
                let previous = response.into_found()?.into_iter().next();
                if let Some(id) = previous.as_ref().and_then(document_id) {
                    debug!("Replacing {} ({})", self.entry.path, id);
                    self.document
                        .insert(ID_FIELD.to_string(), Value::String(id.to_string()));
                }
                ctx.request(CatalogRequest::Put(vec![self.document.clone()]))?;
                self.step = InsertStep::Store { previous };
                Ok(())
            }
            InsertStep::Store { previous } => {
                let id = response
                    .into_stored()?
                    .into_iter()
                    .next()
                    .ok_or(CommandError::UnexpectedResponse("stored"))?;
                self.document
                    .insert(ID_FIELD.to_string(), Value::String(id.clone()));
                info!("Indexed {} as {}", self.entry.path, id);

                for aggregate in groupings(file_kind(self.entry.kind)) {
                    ctx.enqueue_dependent(Box::new(FindOrCreateAggregate::new(
                        *aggregate,
                        self.document.clone(),
                    )));
                }
                if let Some(previous) = previous.take() {
                    enqueue_recounts(ctx, memberships(&previous));
                }
                ctx.finish();
                Ok(())
            }
        }
    }

    fn on_failure(&mut self, _error: &CommandError) {
        // Forget the fingerprint so the next scan retries the file.
        if let Err(err) = self.fingerprints.remove(&self.entry.path) {
            warn!(
                "Failed to roll back fingerprint for {}: {}",
                self.entry.path, err
            );
        }
    }
}

enum RemoveTarget {
    Path(String),
    Prefix(String),
}

enum RemoveStep {
    Lookup,
    Delete { removed: Vec<Document> },
}

/// Deletes one entry, or every entry under a path prefix, and recounts the
/// aggregates they belonged to.
pub struct Remove {
    target: RemoveTarget,
    step: RemoveStep,
}

impl Remove {
    pub fn path(path: &str) -> Self {
        Self {
            target: RemoveTarget::Path(path.to_string()),
            step: RemoveStep::Lookup,
        }
    }

    pub fn subtree(prefix: &str) -> Self {
        Self {
            target: RemoveTarget::Prefix(prefix.to_string()),
            step: RemoveStep::Lookup,
        }
    }

    fn query(&self) -> Query {
        let query = Query::of(FILE_KIND);
        match &self.target {
            RemoveTarget::Path(path) => query.eq("path", path.as_str()),
            RemoveTarget::Prefix(prefix) => query.prefix("path", prefix),
        }
    }
}

impl Command for Remove {
    fn kind(&self) -> &'static str {
        match self.target {
            RemoveTarget::Path(_) => "Remove",
            RemoveTarget::Prefix(_) => "RemoveSubtree",
        }
    }

    fn subject(&self) -> String {
        match &self.target {
            RemoveTarget::Path(path) => path.clone(),
            RemoveTarget::Prefix(prefix) => prefix.clone(),
        }
    }

    fn execute(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        ctx.request(CatalogRequest::Find(self.query()))
    }

    fn on_response(
        &mut self,
        response: CatalogResponse,
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), CommandError> {
        let subject = self.subject();
        match &mut self.step {
            RemoveStep::Lookup => {
                let removed = response.into_found()?;
                if removed.is_empty() {
                    debug!("Nothing indexed under {}", subject);
                    ctx.finish();
                    return Ok(());
                }
                let ids = removed
                    .iter()
                    .filter_map(document_id)
                    .map(|id| id.to_string())
                    .collect();
                ctx.request(CatalogRequest::Delete(ids))?;
                self.step = RemoveStep::Delete { removed };
                Ok(())
            }
            RemoveStep::Delete { removed } => {
                response.expect_write()?;
                info!("Removed {} entries for {}", removed.len(), subject);
                enqueue_recounts(ctx, removed.iter().flat_map(memberships));
                ctx.finish();
                Ok(())
            }
        }
    }
}
