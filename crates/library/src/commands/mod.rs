//! The command family executed by the queue.

mod aggregate;
mod media;
mod schema;

pub use aggregate::{AssignMembership, FindOrCreateAggregate, Recount};
pub use media::{Insert, Remove};
pub use schema::{rebuild_sequence, PutKind, RecordSchemaVersion, RemoveAll, RemoveKind};

use common::AggregateKind;

use crate::queue::{Command, CommandContext};

/// Queues one recount per distinct aggregate.
pub(crate) fn enqueue_recounts<I>(ctx: &mut CommandContext<'_>, targets: I)
where
    I: IntoIterator<Item = (AggregateKind, String)>,
{
    let mut seen = std::collections::HashSet::new();
    for (kind, id) in targets {
        if seen.insert(id.clone()) {
            let recount: Box<dyn Command> = Box::new(Recount::new(kind, id));
            ctx.enqueue_dependent(recount);
        }
    }
}
