//! Contract between the command queue and the asynchronous document store
//! that holds the authoritative catalog.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::queue::{CommandError, QueueEvent, RequestId};

pub type Document = serde_json::Map<String, Value>;

pub const ID_FIELD: &str = "_id";
pub const KIND_FIELD: &str = "_kind";

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    /// Primary-strength comparison: equal ignoring case.
    EqIgnoreCase(String, String),
    Prefix(String, String),
}

impl Filter {
    fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(field, value) => doc.get(field) == Some(value),
            Filter::EqIgnoreCase(field, text) => doc
                .get(field)
                .and_then(Value::as_str)
                .map(|found| found.to_lowercase() == text.to_lowercase())
                .unwrap_or(false),
            Filter::Prefix(field, prefix) => doc
                .get(field)
                .and_then(Value::as_str)
                .map(|found| found.starts_with(prefix.as_str()))
                .unwrap_or(false),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub kind: String,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn of(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            filters: Vec::new(),
        }
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.to_string(), value.into()));
        self
    }

    pub fn eq_ignore_case(mut self, field: &str, text: &str) -> Self {
        self.filters
            .push(Filter::EqIgnoreCase(field.to_string(), text.to_string()));
        self
    }

    pub fn prefix(mut self, field: &str, prefix: &str) -> Self {
        self.filters
            .push(Filter::Prefix(field.to_string(), prefix.to_string()));
        self
    }

    /// Checks the filters only; kind matching belongs to the store.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindDefinition {
    pub name: String,
    pub extends: Option<String>,
}

impl KindDefinition {
    pub fn new(name: &str, extends: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            extends: extends.map(|base| base.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CatalogRequest {
    Find(Query),
    Count(Query),
    Put(Vec<Document>),
    Merge(Vec<Document>),
    Delete(Vec<String>),
    PutKind(KindDefinition),
    DelKind(String),
}

impl CatalogRequest {
    pub fn name(&self) -> &'static str {
        match self {
            CatalogRequest::Find(_) => "find",
            CatalogRequest::Count(_) => "count",
            CatalogRequest::Put(_) => "put",
            CatalogRequest::Merge(_) => "merge",
            CatalogRequest::Delete(_) => "delete",
            CatalogRequest::PutKind(_) => "put_kind",
            CatalogRequest::DelKind(_) => "del_kind",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CatalogResponse {
    Found(Vec<Document>),
    Counted(u64),
    Stored(Vec<String>),
    Merged(u64),
    Deleted(u64),
    KindStored,
    KindDeleted,
}

impl CatalogResponse {
    pub fn into_found(self) -> Result<Vec<Document>, CommandError> {
        match self {
            CatalogResponse::Found(docs) => Ok(docs),
            other => Err(CommandError::UnexpectedResponse(other.name())),
        }
    }

    pub fn into_count(self) -> Result<u64, CommandError> {
        match self {
            CatalogResponse::Counted(count) => Ok(count),
            other => Err(CommandError::UnexpectedResponse(other.name())),
        }
    }

    pub fn into_stored(self) -> Result<Vec<String>, CommandError> {
        match self {
            CatalogResponse::Stored(ids) => Ok(ids),
            other => Err(CommandError::UnexpectedResponse(other.name())),
        }
    }

    /// For writes whose payload the caller does not need.
    pub fn expect_write(self) -> Result<(), CommandError> {
        match self {
            CatalogResponse::Merged(_)
            | CatalogResponse::Deleted(_)
            | CatalogResponse::KindStored
            | CatalogResponse::KindDeleted => Ok(()),
            other => Err(CommandError::UnexpectedResponse(other.name())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CatalogResponse::Found(_) => "found",
            CatalogResponse::Counted(_) => "counted",
            CatalogResponse::Stored(_) => "stored",
            CatalogResponse::Merged(_) => "merged",
            CatalogResponse::Deleted(_) => "deleted",
            CatalogResponse::KindStored => "kind_stored",
            CatalogResponse::KindDeleted => "kind_deleted",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CatalogError {
    Storage(String),
    UnknownKind(String),
    MissingId,
    NotFound(String),
    Invalid(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Storage(err) => write!(f, "storage error: {}", err),
            CatalogError::UnknownKind(kind) => write!(f, "unknown kind: {}", kind),
            CatalogError::MissingId => write!(f, "document has no id"),
            CatalogError::NotFound(id) => write!(f, "no document with id {}", id),
            CatalogError::Invalid(reason) => write!(f, "invalid document: {}", reason),
        }
    }
}

impl std::error::Error for CatalogError {}

/// One-shot completion handle for a submitted request.
pub struct Reply {
    id: RequestId,
    events: UnboundedSender<QueueEvent>,
}

impl Reply {
    pub(crate) fn new(id: RequestId, events: UnboundedSender<QueueEvent>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn send(self, result: Result<CatalogResponse, CatalogError>) {
        // The queue may already be gone during shutdown.
        let _ = self.events.send(QueueEvent::Response {
            id: self.id,
            result,
        });
    }
}

/// An asynchronous document store. `submit` must return promptly; the
/// outcome arrives later through `reply`.
pub trait BackingCatalog {
    fn submit(&mut self, request: CatalogRequest, reply: Reply);
}

pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

pub fn document_kind(doc: &Document) -> Option<&str> {
    doc.get(KIND_FIELD).and_then(Value::as_str)
}

pub fn field_str<'a>(doc: &'a Document, field: &str) -> &'a str {
    doc.get(field).and_then(Value::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn filters_combine() {
        let track = doc(json!({"path": "/media/x/a.mp3", "genre": "Rock", "size": 4}));
        assert!(Query::of("media.file")
            .prefix("path", "/media/x/")
            .eq_ignore_case("genre", "rock")
            .eq("size", 4)
            .matches(&track));
        assert!(!Query::of("media.file")
            .prefix("path", "/media/x/")
            .eq("genre", "rock")
            .matches(&track));
        assert!(!Query::of("media.file")
            .eq_ignore_case("missing", "")
            .matches(&track));
    }

    #[test]
    fn response_accessors_reject_other_shapes() {
        assert_eq!(CatalogResponse::Counted(3).into_count().unwrap(), 3);
        assert!(matches!(
            CatalogResponse::Counted(3).into_found(),
            Err(CommandError::UnexpectedResponse("counted"))
        ));
        assert!(CatalogResponse::Deleted(0).expect_write().is_ok());
        assert!(CatalogResponse::Found(Vec::new()).expect_write().is_err());
    }
}
