//! Serialized execution of catalog commands.
//!
//! At most one command is current at a time. A command may issue one catalog
//! request at a time and is resumed when its response arrives as a
//! [`QueueEvent::Response`]. Commands spawned while handling a step are
//! appended to the tail of the queue and never run inline; advancing to the
//! next command always goes through a posted [`QueueEvent::Advance`].

use std::collections::{HashSet, VecDeque};
use std::fmt;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::catalog::{BackingCatalog, CatalogError, CatalogRequest, CatalogResponse, Reply};
use crate::LibraryError;

pub type RequestId = u64;

#[derive(Debug)]
pub enum QueueEvent {
    /// Deferred wake-up: release the retired command and start the next one.
    Advance,
    Response {
        id: RequestId,
        result: Result<CatalogResponse, CatalogError>,
    },
}

pub type QueueEvents = UnboundedReceiver<QueueEvent>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Executing,
    /// A rebuild discarded pending work while a command was still current.
    Draining,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub executed: u64,
    pub failed: u64,
    pub coalesced: u64,
    pub discarded: u64,
}

#[derive(Debug)]
pub enum CommandError {
    Catalog(CatalogError),
    UnexpectedResponse(&'static str),
    AlreadyAwaiting,
    Library(LibraryError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Catalog(err) => write!(f, "catalog error: {}", err),
            CommandError::UnexpectedResponse(name) => write!(f, "unexpected response: {}", name),
            CommandError::AlreadyAwaiting => write!(f, "a request is already outstanding"),
            CommandError::Library(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<CatalogError> for CommandError {
    fn from(err: CatalogError) -> Self {
        CommandError::Catalog(err)
    }
}

impl From<LibraryError> for CommandError {
    fn from(err: LibraryError) -> Self {
        CommandError::Library(err)
    }
}

pub trait Command {
    /// Short tag used in logs.
    fn kind(&self) -> &'static str;

    /// The path or identity the command acts on.
    fn subject(&self) -> String;

    /// Commands sharing a key are collapsed while one of them is still queued.
    fn coalesce_key(&self) -> Option<String> {
        None
    }

    fn execute(&mut self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError>;

    fn on_response(
        &mut self,
        response: CatalogResponse,
        _ctx: &mut CommandContext<'_>,
    ) -> Result<(), CommandError> {
        Err(CommandError::UnexpectedResponse(response.name()))
    }

    /// Called once when the command is discarded because of `error`.
    fn on_failure(&mut self, _error: &CommandError) {}
}

/// What a command may do while it holds the queue.
pub struct CommandContext<'a> {
    catalog: &'a mut dyn BackingCatalog,
    events: &'a UnboundedSender<QueueEvent>,
    next_request: &'a mut RequestId,
    awaiting: Option<RequestId>,
    dependents: Vec<Box<dyn Command>>,
    finished: bool,
}

impl<'a> CommandContext<'a> {
    pub fn request(&mut self, request: CatalogRequest) -> Result<(), CommandError> {
        if self.awaiting.is_some() {
            return Err(CommandError::AlreadyAwaiting);
        }
        let id = *self.next_request;
        *self.next_request += 1;
        self.awaiting = Some(id);
        debug!("Submitting catalog {} #{}", request.name(), id);
        self.catalog
            .submit(request, Reply::new(id, self.events.clone()));
        Ok(())
    }

    /// Queues follow-up work behind everything already pending. It never
    /// wakes the queue; the current command's retirement does.
    pub fn enqueue_dependent(&mut self, command: Box<dyn Command>) {
        self.dependents.push(command);
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }
}

struct Current {
    command: Box<dyn Command>,
    awaiting: RequestId,
    done: bool,
}

enum Step {
    Execute,
    Respond(Result<CatalogResponse, CatalogError>),
}

pub struct CommandQueue {
    catalog: Box<dyn BackingCatalog>,
    events: UnboundedSender<QueueEvent>,
    pending: VecDeque<Box<dyn Command>>,
    coalesced: HashSet<String>,
    current: Option<Current>,
    retiring: Option<Box<dyn Command>>,
    state: QueueState,
    wake_scheduled: bool,
    next_request: RequestId,
    stats: QueueStats,
}

impl CommandQueue {
    pub fn new(catalog: Box<dyn BackingCatalog>) -> (Self, QueueEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            catalog,
            events,
            pending: VecDeque::new(),
            coalesced: HashSet::new(),
            current: None,
            retiring: None,
            state: QueueState::Idle,
            wake_scheduled: false,
            next_request: 1,
            stats: QueueStats::default(),
        };
        (queue, receiver)
    }

    /// Appends a command and wakes the queue if nothing is running.
    pub fn enqueue_top_level(&mut self, command: Box<dyn Command>) {
        if self.push_pending(command) && self.state == QueueState::Idle {
            self.schedule_advance();
        }
    }

    /// Appends a command without waking the queue. Only valid while a command
    /// is current, since its retirement drives the queue forward.
    fn enqueue_dependent(&mut self, command: Box<dyn Command>) {
        self.push_pending(command);
    }

    /// Drops all pending work and queues `sequence` in its place. A command
    /// that is already current runs to completion, but anything it spawns is
    /// discarded.
    pub fn prepare_for_rebuild(&mut self, sequence: Vec<Box<dyn Command>>) {
        let dropped = self.pending.len();
        self.pending.clear();
        self.coalesced.clear();
        self.stats.discarded += dropped as u64;
        if self.current.is_some() {
            self.state = QueueState::Draining;
        }
        info!(
            "Rebuild requested: discarded {} pending commands, queued {}",
            dropped,
            sequence.len()
        );
        for command in sequence {
            self.enqueue_top_level(command);
        }
    }

    pub fn handle(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Advance => self.advance(),
            QueueEvent::Response { id, result } => {
                let matches = self
                    .current
                    .as_ref()
                    .map(|current| current.awaiting == id)
                    .unwrap_or(false);
                if !matches {
                    debug!("Ignoring stale catalog response #{}", id);
                    return;
                }
                if let Some(current) = self.current.take() {
                    if current.done {
                        self.retire(current.command);
                    } else {
                        self.run(current.command, Step::Respond(result));
                    }
                }
            }
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Number of commands waiting behind the current one.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Nothing current, nothing pending and no wake-up in flight.
    pub fn is_idle(&self) -> bool {
        self.state == QueueState::Idle
            && self.current.is_none()
            && self.pending.is_empty()
            && !self.wake_scheduled
    }

    fn push_pending(&mut self, command: Box<dyn Command>) -> bool {
        if let Some(key) = command.coalesce_key() {
            if !self.coalesced.insert(key) {
                self.stats.coalesced += 1;
                debug!(
                    "Coalesced {} for {} into a queued one",
                    command.kind(),
                    command.subject()
                );
                return false;
            }
        }
        self.pending.push_back(command);
        true
    }

    fn schedule_advance(&mut self) {
        if self.wake_scheduled {
            return;
        }
        self.wake_scheduled = true;
        if let Err(err) = self.events.send(QueueEvent::Advance) {
            debug!("Queue wake-up not delivered: {}", err);
            self.wake_scheduled = false;
        }
    }

    fn advance(&mut self) {
        self.wake_scheduled = false;
        self.retiring = None;
        if self.current.is_some() {
            return;
        }
        let command = match self.pending.pop_front() {
            Some(command) => command,
            None => {
                self.state = QueueState::Idle;
                return;
            }
        };
        if let Some(key) = command.coalesce_key() {
            self.coalesced.remove(&key);
        }
        self.state = QueueState::Executing;
        self.run(command, Step::Execute);
    }

    fn run(&mut self, mut command: Box<dyn Command>, step: Step) {
        let mut ctx = CommandContext {
            catalog: self.catalog.as_mut(),
            events: &self.events,
            next_request: &mut self.next_request,
            awaiting: None,
            dependents: Vec::new(),
            finished: false,
        };
        let result = match step {
            Step::Execute => command.execute(&mut ctx),
            Step::Respond(Ok(response)) => command.on_response(response, &mut ctx),
            Step::Respond(Err(err)) => Err(CommandError::Catalog(err)),
        };
        let CommandContext {
            awaiting,
            dependents,
            finished,
            ..
        } = ctx;

        let failed = match result {
            Err(err) => {
                self.stats.failed += 1;
                warn!(
                    "{} failed for {}: {}",
                    command.kind(),
                    command.subject(),
                    err
                );
                command.on_failure(&err);
                if !dependents.is_empty() {
                    debug!("Dropping {} follow-ups of failed command", dependents.len());
                }
                true
            }
            Ok(()) => {
                if self.state == QueueState::Draining {
                    if !dependents.is_empty() {
                        self.stats.discarded += dependents.len() as u64;
                        debug!(
                            "Discarding {} follow-ups of {} during rebuild",
                            dependents.len(),
                            command.kind()
                        );
                    }
                } else {
                    for dependent in dependents {
                        self.enqueue_dependent(dependent);
                    }
                }
                false
            }
        };

        if failed || finished {
            if finished {
                self.stats.executed += 1;
            }
            match awaiting {
                // Its request is still in flight; hold the slot until it lands.
                Some(id) => {
                    self.current = Some(Current {
                        command,
                        awaiting: id,
                        done: true,
                    })
                }
                None => self.retire(command),
            }
        } else if let Some(id) = awaiting {
            self.current = Some(Current {
                command,
                awaiting: id,
                done: false,
            });
        } else {
            self.stats.failed += 1;
            warn!(
                "{} for {} neither finished nor issued a request",
                command.kind(),
                command.subject()
            );
            self.retire(command);
        }
    }

    fn retire(&mut self, command: Box<dyn Command>) {
        self.retiring = Some(command);
        self.state = QueueState::Idle;
        self.schedule_advance();
    }
}
