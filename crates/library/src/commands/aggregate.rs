use common::AggregateKind;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::catalog::{document_id, CatalogRequest, CatalogResponse, Document, Query, ID_FIELD};
use crate::kinds::aggregate_kind;
use crate::queue::{Command, CommandContext, CommandError};
use crate::serializer::{aggregate_lookup, aggregate_seed, member_counts, object};

enum LookupStep {
    Find,
    Create,
}

/// Resolves the aggregate a freshly stored member belongs to, creating it
/// when missing, then queues the membership update and a recount.
pub struct FindOrCreateAggregate {
    kind: AggregateKind,
    member: Document,
    step: LookupStep,
}

impl FindOrCreateAggregate {
    pub fn new(kind: AggregateKind, member: Document) -> Self {
        Self {
            kind,
            member,
            step: LookupStep::Find,
        }
    }

    fn resolved(&mut self, id: String, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        let member_id = document_id(&self.member)
            .ok_or(CommandError::UnexpectedResponse("member without id"))?
            .to_string();
        ctx.enqueue_dependent(Box::new(AssignMembership::new(
            self.kind,
            member_id,
            id.clone(),
        )));
        ctx.enqueue_dependent(Box::new(Recount::new(self.kind, id)));
        ctx.finish();
        Ok(())
    }
}

impl Command for FindOrCreateAggregate {
    fn kind(&self) -> &'static str {
        "FindOrCreateAggregate"
    }

    fn subject(&self) -> String {
        format!(
            "{} of {}",
            self.kind.as_str(),
            self.member
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or("?")
        )
    }

    fn execute(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        ctx.request(CatalogRequest::Find(aggregate_lookup(self.kind, &self.member)))
    }

    fn on_response(
        &mut self,
        response: CatalogResponse,
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), CommandError> {
        match self.step {
            LookupStep::Find => {
                let existing = response
                    .into_found()?
                    .into_iter()
                    .find_map(|doc| document_id(&doc).map(|id| id.to_string()));
                if let Some(id) = existing {
                    return self.resolved(id, ctx);
                }
                let seed = aggregate_seed(self.kind, &self.member);
                ctx.request(CatalogRequest::Put(vec![seed]))?;
                self.step = LookupStep::Create;
                Ok(())
            }
            LookupStep::Create => {
                let id = response
                    .into_stored()?
                    .into_iter()
                    .next()
                    .ok_or(CommandError::UnexpectedResponse("stored"))?;
                info!("Created {} {}", self.kind.as_str(), id);
                self.resolved(id, ctx)
            }
        }
    }
}

/// Points a member at its aggregate.
pub struct AssignMembership {
    kind: AggregateKind,
    member_id: String,
    aggregate_id: String,
}

impl AssignMembership {
    pub fn new(kind: AggregateKind, member_id: String, aggregate_id: String) -> Self {
        Self {
            kind,
            member_id,
            aggregate_id,
        }
    }
}

impl Command for AssignMembership {
    fn kind(&self) -> &'static str {
        "AssignMembership"
    }

    fn subject(&self) -> String {
        format!("{} -> {}", self.member_id, self.aggregate_id)
    }

    fn execute(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        let mut patch = Document::new();
        patch.insert(ID_FIELD.to_string(), Value::String(self.member_id.clone()));
        patch.insert(
            self.kind.member_field().to_string(),
            Value::String(self.aggregate_id.clone()),
        );
        ctx.request(CatalogRequest::Merge(vec![patch]))
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

enum RecountStep {
    Lookup,
    Counting {
        queries: Vec<(&'static str, Query)>,
        counts: Vec<Option<u64>>,
    },
    Write,
}

/// Recomputes an aggregate's totals from its current members. Counts are
/// gathered one query at a time and written only once every one of them has
/// come back; an aggregate left with no members is deleted.
pub struct Recount {
    kind: AggregateKind,
    id: String,
    step: RecountStep,
}

impl Recount {
    pub fn new(kind: AggregateKind, id: String) -> Self {
        Self {
            kind,
            id,
            step: RecountStep::Lookup,
        }
    }
}

impl Command for Recount {
    fn kind(&self) -> &'static str {
        "Recount"
    }

    fn subject(&self) -> String {
        format!("{} {}", self.kind.as_str(), self.id)
    }

    fn coalesce_key(&self) -> Option<String> {
        Some(format!("recount:{}", self.id))
    }

    fn execute(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        ctx.request(CatalogRequest::Find(
            Query::of(aggregate_kind(self.kind)).eq(ID_FIELD, self.id.as_str()),
        ))
    }

    fn on_response(
        &mut self,
        response: CatalogResponse,
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), CommandError> {
        match &mut self.step {
            RecountStep::Lookup => {
                let aggregate = match response.into_found()?.into_iter().next() {
                    Some(aggregate) => aggregate,
                    None => {
                        debug!("{} {} is gone; nothing to recount", self.kind.as_str(), self.id);
                        ctx.finish();
                        return Ok(());
                    }
                };
                let queries = member_counts(self.kind, &aggregate);
                let counts = vec![None; queries.len()];
                let (_, first) = queries
                    .first()
                    .ok_or(CommandError::UnexpectedResponse("no counters"))?;
                ctx.request(CatalogRequest::Count(first.clone()))?;
                self.step = RecountStep::Counting { queries, counts };
                Ok(())
            }
            RecountStep::Counting { queries, counts } => {
                let count = response.into_count()?;
                if let Some(slot) = counts.iter_mut().find(|slot| slot.is_none()) {
                    *slot = Some(count);
                }

                let next = counts
                    .iter()
                    .zip(queries.iter())
                    .find_map(|(count, (_, query))| count.is_none().then(|| query.clone()));
                if let Some(query) = next {
                    return ctx.request(CatalogRequest::Count(query));
                }

                let mut total = Document::new();
                for ((name, _), count) in queries.iter().zip(counts.iter()) {
                    total.insert(name.to_string(), json!(count.unwrap_or(0)));
                }
                if total.values().all(|count| count.as_u64() == Some(0)) {
                    info!("Deleting empty {} {}", self.kind.as_str(), self.id);
                    ctx.request(CatalogRequest::Delete(vec![self.id.clone()]))?;
                } else {
                    debug!("{} {} totals {:?}", self.kind.as_str(), self.id, total);
                    let mut patch = object(json!({ "total": total }));
                    patch.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
                    ctx.request(CatalogRequest::Merge(vec![patch]))?;
                }
                self.step = RecountStep::Write;
                Ok(())
            }
            RecountStep::Write => {
                response.expect_write()?;
                ctx.finish();
                Ok(())
            }
        }
    }
}
