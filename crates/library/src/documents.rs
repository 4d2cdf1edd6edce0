use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, Table, TableDefinition, TableError};
use serde_json::Value;
use tracing::{debug, info};

use crate::catalog::{
    document_id, document_kind, BackingCatalog, CatalogError, CatalogRequest, CatalogResponse,
    Document, Filter, KindDefinition, Query, Reply, ID_FIELD,
};
use crate::{decode_value, encode_value, open_or_create_db, LibraryError};

const KINDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kinds");
const DOCUMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
// Secondary indexes keyed by "<value>\0<id>", valued by id.
const BY_KIND_TABLE: TableDefinition<&str, &str> = TableDefinition::new("documents_by_kind");
const BY_PATH_TABLE: TableDefinition<&str, &str> = TableDefinition::new("documents_by_path");

const PATH_FIELD: &str = "path";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Run on the caller's stack; the reply still goes through the event channel.
    Inline,
    /// Run on tokio's blocking pool.
    Blocking,
}

/// JSON document store on redb, addressed by kind.
#[derive(Clone)]
pub struct DocumentCatalog {
    db: Arc<Database>,
    dispatch: Dispatch,
}

impl DocumentCatalog {
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        let db = open_or_create_db(path)?;
        info!("Opened catalog at {:?}", path);
        let catalog = Self {
            db: Arc::new(db),
            dispatch: Dispatch::Blocking,
        };
        catalog.ensure_indexes()?;
        Ok(catalog)
    }

    /// Builds the secondary indexes for catalogs written without them.
    fn ensure_indexes(&self) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let table = write_txn.open_table(DOCUMENTS_TABLE)?;
            let mut by_kind = write_txn.open_table(BY_KIND_TABLE)?;
            let mut by_path = write_txn.open_table(BY_PATH_TABLE)?;
            if by_kind.len()? == 0 && table.len()? > 0 {
                let mut indexed = 0u64;
                for entry in table.iter()? {
                    let entry = entry?;
                    let doc: Document = serde_json::from_slice(entry.1.value())?;
                    index_document(&mut by_kind, &mut by_path, entry.0.value(), &doc)?;
                    indexed += 1;
                }
                info!("Indexed {} catalog documents", indexed);
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn inline(mut self) -> Self {
        self.dispatch = Dispatch::Inline;
        self
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    pub fn execute(&self, request: CatalogRequest) -> Result<CatalogResponse, CatalogError> {
        let name = request.name();
        let result = match request {
            CatalogRequest::Find(query) => self.find(&query).map(CatalogResponse::Found),
            CatalogRequest::Count(query) => self
                .find(&query)
                .map(|docs| CatalogResponse::Counted(docs.len() as u64)),
            CatalogRequest::Put(docs) => self.put(docs).map(CatalogResponse::Stored),
            CatalogRequest::Merge(docs) => self.merge(docs).map(CatalogResponse::Merged),
            CatalogRequest::Delete(ids) => self.delete(&ids).map(CatalogResponse::Deleted),
            CatalogRequest::PutKind(definition) => self
                .put_kind(&definition)
                .map(|_| CatalogResponse::KindStored),
            CatalogRequest::DelKind(kind) => {
                self.del_kind(&kind).map(|_| CatalogResponse::KindDeleted)
            }
        };
        result.map_err(|err| {
            debug!("Catalog {} failed: {}", name, err);
            match err {
                LibraryError::Catalog(err) => err,
                other => CatalogError::Storage(other.to_string()),
            }
        })
    }

    /// Every document of `kind` or a kind derived from it.
    pub fn documents(&self, kind: &str) -> Result<Vec<Document>, LibraryError> {
        self.find(&Query::of(kind))
    }

    pub fn kinds(&self) -> Result<HashMap<String, KindDefinition>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(KINDS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(HashMap::new()),
            Err(err) => return Err(err.into()),
        };
        let mut kinds = HashMap::new();
        for entry in table.iter()? {
            let entry = entry?;
            let definition: KindDefinition = decode_value(entry.1.value())?;
            kinds.insert(entry.0.value().to_string(), definition);
        }
        Ok(kinds)
    }

    fn find(&self, query: &Query) -> Result<Vec<Document>, LibraryError> {
        let kinds = self.kinds()?;
        if !kinds.contains_key(&query.kind) {
            return Ok(Vec::new());
        }

        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(DOCUMENTS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let ids = match path_filter(query) {
            Some(prefix) => {
                let by_path = read_txn.open_table(BY_PATH_TABLE)?;
                indexed_ids(&by_path, &prefix)?
            }
            None => {
                let by_kind = read_txn.open_table(BY_KIND_TABLE)?;
                let mut ids = Vec::new();
                for kind in kinds
                    .keys()
                    .filter(|kind| kind_extends(&kinds, kind, &query.kind))
                {
                    ids.extend(indexed_ids(&by_kind, &index_prefix(kind))?);
                }
                ids
            }
        };

        let mut found = Vec::new();
        for id in ids {
            let bytes = match table.get(id.as_str())? {
                Some(value) => value.value().to_vec(),
                None => continue,
            };
            let doc: Document = serde_json::from_slice(&bytes)?;
            let kind = document_kind(&doc).unwrap_or("");
            if kind_extends(&kinds, kind, &query.kind) && query.matches(&doc) {
                found.push(doc);
            }
        }
        Ok(found)
    }

    fn put(&self, docs: Vec<Document>) -> Result<Vec<String>, LibraryError> {
        let kinds = self.kinds()?;
        let mut ids = Vec::with_capacity(docs.len());

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            let mut by_kind = write_txn.open_table(BY_KIND_TABLE)?;
            let mut by_path = write_txn.open_table(BY_PATH_TABLE)?;
            for mut doc in docs {
                let kind = document_kind(&doc)
                    .ok_or_else(|| CatalogError::Invalid("missing _kind".to_string()))?;
                if !kinds.contains_key(kind) {
                    return Err(CatalogError::UnknownKind(kind.to_string()).into());
                }
                let id = match document_id(&doc) {
                    Some(id) => id.to_string(),
                    None => uuid::Uuid::new_v4().to_string(),
                };
                doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                let previous = table.get(id.as_str())?.map(|value| value.value().to_vec());
                if let Some(previous) = previous {
                    let previous: Document = serde_json::from_slice(&previous)?;
                    unindex_document(&mut by_kind, &mut by_path, &id, &previous)?;
                }
                let bytes = serde_json::to_vec(&doc)?;
                table.insert(id.as_str(), bytes.as_slice())?;
                index_document(&mut by_kind, &mut by_path, &id, &doc)?;
                ids.push(id);
            }
        }
        write_txn.commit()?;
        Ok(ids)
    }

    fn merge(&self, docs: Vec<Document>) -> Result<u64, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let merged = {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            let mut by_kind = write_txn.open_table(BY_KIND_TABLE)?;
            let mut by_path = write_txn.open_table(BY_PATH_TABLE)?;
            let mut merged = 0u64;
            for patch in docs {
                let id = document_id(&patch)
                    .ok_or(CatalogError::MissingId)?
                    .to_string();
                let existing = table.get(id.as_str())?.map(|value| value.value().to_vec());
                let bytes = existing.ok_or_else(|| CatalogError::NotFound(id.clone()))?;
                let mut doc: Document = serde_json::from_slice(&bytes)?;
                unindex_document(&mut by_kind, &mut by_path, &id, &doc)?;
                merge_into(&mut doc, patch);
                let bytes = serde_json::to_vec(&doc)?;
                table.insert(id.as_str(), bytes.as_slice())?;
                index_document(&mut by_kind, &mut by_path, &id, &doc)?;
                merged += 1;
            }
            merged
        };
        write_txn.commit()?;
        Ok(merged)
    }

    fn delete(&self, ids: &[String]) -> Result<u64, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            let mut by_kind = write_txn.open_table(BY_KIND_TABLE)?;
            let mut by_path = write_txn.open_table(BY_PATH_TABLE)?;
            let mut deleted = 0u64;
            for id in ids {
                let removed = table.remove(id.as_str())?.map(|value| value.value().to_vec());
                if let Some(bytes) = removed {
                    let doc: Document = serde_json::from_slice(&bytes)?;
                    unindex_document(&mut by_kind, &mut by_path, id, &doc)?;
                    deleted += 1;
                }
            }
            deleted
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    fn put_kind(&self, definition: &KindDefinition) -> Result<(), LibraryError> {
        if let Some(base) = &definition.extends {
            if !self.kinds()?.contains_key(base) {
                return Err(CatalogError::UnknownKind(base.clone()).into());
            }
        }
        let bytes = encode_value(definition)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(KINDS_TABLE)?;
            table.insert(definition.name.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        debug!("Registered kind {}", definition.name);
        Ok(())
    }

    /// Removes the definition and every document stored under exactly this kind.
    fn del_kind(&self, kind: &str) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut kinds = write_txn.open_table(KINDS_TABLE)?;
            kinds.remove(kind)?;

            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            let mut by_kind = write_txn.open_table(BY_KIND_TABLE)?;
            let mut by_path = write_txn.open_table(BY_PATH_TABLE)?;
            let doomed = indexed_ids(&by_kind, &index_prefix(kind))?;
            for id in &doomed {
                let removed = table.remove(id.as_str())?.map(|value| value.value().to_vec());
                match removed {
                    Some(bytes) => {
                        let doc: Document = serde_json::from_slice(&bytes)?;
                        unindex_document(&mut by_kind, &mut by_path, id, &doc)?;
                    }
                    None => {
                        by_kind.remove(index_key(kind, id).as_str())?;
                    }
                }
            }
            if !doomed.is_empty() {
                debug!("Purged {} documents of kind {}", doomed.len(), kind);
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl BackingCatalog for DocumentCatalog {
    fn submit(&mut self, request: CatalogRequest, reply: Reply) {
        match self.dispatch {
            Dispatch::Inline => reply.send(self.execute(request)),
            Dispatch::Blocking => {
                let catalog = self.clone();
                tokio::task::spawn_blocking(move || reply.send(catalog.execute(request)));
            }
        }
    }
}

type IndexTable<'db, 'txn> = Table<'db, 'txn, &'static str, &'static str>;

fn index_prefix(value: &str) -> String {
    format!("{}\u{0}", value)
}

fn index_key(value: &str, id: &str) -> String {
    format!("{}\u{0}{}", value, id)
}

fn document_path(doc: &Document) -> Option<&str> {
    doc.get(PATH_FIELD).and_then(Value::as_str)
}

fn index_document(
    by_kind: &mut IndexTable<'_, '_>,
    by_path: &mut IndexTable<'_, '_>,
    id: &str,
    doc: &Document,
) -> Result<(), LibraryError> {
    if let Some(kind) = document_kind(doc) {
        by_kind.insert(index_key(kind, id).as_str(), id)?;
    }
    if let Some(path) = document_path(doc) {
        by_path.insert(index_key(path, id).as_str(), id)?;
    }
    Ok(())
}

fn unindex_document(
    by_kind: &mut IndexTable<'_, '_>,
    by_path: &mut IndexTable<'_, '_>,
    id: &str,
    doc: &Document,
) -> Result<(), LibraryError> {
    if let Some(kind) = document_kind(doc) {
        by_kind.remove(index_key(kind, id).as_str())?;
    }
    if let Some(path) = document_path(doc) {
        by_path.remove(index_key(path, id).as_str())?;
    }
    Ok(())
}

/// Ids stored under index keys starting with `prefix`.
fn indexed_ids<T>(table: &T, prefix: &str) -> Result<Vec<String>, LibraryError>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let mut ids = Vec::new();
    for entry in table.range(prefix..)? {
        let entry = entry?;
        if !entry.0.value().starts_with(prefix) {
            break;
        }
        ids.push(entry.1.value().to_string());
    }
    Ok(ids)
}

/// Index prefix answering a path equality or path prefix filter, if any.
fn path_filter(query: &Query) -> Option<String> {
    query.filters.iter().find_map(|filter| match filter {
        Filter::Eq(field, Value::String(path)) if field == PATH_FIELD => Some(index_prefix(path)),
        Filter::Prefix(field, prefix) if field == PATH_FIELD => Some(prefix.clone()),
        _ => None,
    })
}

fn kind_extends(kinds: &HashMap<String, KindDefinition>, kind: &str, wanted: &str) -> bool {
    let mut current = Some(kind);
    let mut hops = 0;
    while let Some(name) = current {
        if name == wanted {
            return true;
        }
        hops += 1;
        if hops > kinds.len() {
            return false;
        }
        current = kinds.get(name).and_then(|def| def.extends.as_deref());
    }
    false
}

fn merge_into(target: &mut Document, patch: Document) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
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

    fn catalog() -> (tempfile::TempDir, DocumentCatalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = DocumentCatalog::open(&dir.path().join("catalog.redb"))
            .unwrap()
            .inline();
        catalog
            .execute(CatalogRequest::PutKind(KindDefinition::new("file", None)))
            .unwrap();
        catalog
            .execute(CatalogRequest::PutKind(KindDefinition::new(
                "audio",
                Some("file"),
            )))
            .unwrap();
        (dir, catalog)
    }

    fn stored_ids(response: CatalogResponse) -> Vec<String> {
        match response {
            CatalogResponse::Stored(ids) => ids,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn base_kind_queries_see_derived_documents() {
        let (_dir, catalog) = catalog();
        catalog
            .execute(CatalogRequest::Put(vec![
                doc(json!({"_kind": "audio", "path": "/m/a.mp3"})),
                doc(json!({"_kind": "file", "path": "/m/b.txt"})),
            ]))
            .unwrap();

        assert_eq!(catalog.documents("file").unwrap().len(), 2);
        assert_eq!(catalog.documents("audio").unwrap().len(), 1);
        assert!(catalog.documents("video").unwrap().is_empty());
    }

    #[test]
    fn put_with_id_replaces_whole_document() {
        let (_dir, catalog) = catalog();
        let ids = stored_ids(
            catalog
                .execute(CatalogRequest::Put(vec![doc(
                    json!({"_kind": "audio", "path": "/m/a.mp3", "title": "Old"}),
                )]))
                .unwrap(),
        );
        catalog
            .execute(CatalogRequest::Put(vec![doc(
                json!({"_id": ids[0], "_kind": "audio", "path": "/m/a.mp3"}),
            )]))
            .unwrap();

        let docs = catalog.documents("audio").unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].get("title").is_none());
    }

    #[test]
    fn put_rejects_unregistered_kinds() {
        let (_dir, catalog) = catalog();
        let result = catalog.execute(CatalogRequest::Put(vec![doc(json!({"_kind": "nope"}))]));
        assert_eq!(result, Err(CatalogError::UnknownKind("nope".to_string())));
    }

    #[test]
    fn merge_is_recursive() {
        let (_dir, catalog) = catalog();
        let ids = stored_ids(
            catalog
                .execute(CatalogRequest::Put(vec![doc(
                    json!({"_kind": "file", "total": {"tracks": 1, "albums": 2}}),
                )]))
                .unwrap(),
        );
        catalog
            .execute(CatalogRequest::Merge(vec![doc(
                json!({"_id": ids[0], "total": {"tracks": 5}}),
            )]))
            .unwrap();

        let docs = catalog.documents("file").unwrap();
        assert_eq!(docs[0]["total"], json!({"tracks": 5, "albums": 2}));

        let missing = catalog.execute(CatalogRequest::Merge(vec![doc(json!({"_id": "ghost"}))]));
        assert_eq!(missing, Err(CatalogError::NotFound("ghost".to_string())));
    }

    #[test]
    fn del_kind_purges_its_documents() {
        let (_dir, catalog) = catalog();
        catalog
            .execute(CatalogRequest::Put(vec![
                doc(json!({"_kind": "audio"})),
                doc(json!({"_kind": "file"})),
            ]))
            .unwrap();
        catalog
            .execute(CatalogRequest::DelKind("audio".to_string()))
            .unwrap();
        assert_eq!(catalog.documents("file").unwrap().len(), 1);
        assert!(!catalog.kinds().unwrap().contains_key("audio"));

        // Deleting a kind that is not there is fine.
        assert_eq!(
            catalog.execute(CatalogRequest::DelKind("audio".to_string())),
            Ok(CatalogResponse::KindDeleted)
        );
    }

    #[test]
    fn path_lookups_follow_writes() {
        let (_dir, catalog) = catalog();
        let ids = stored_ids(
            catalog
                .execute(CatalogRequest::Put(vec![
                    doc(json!({"_kind": "audio", "path": "/m/x/a.mp3"})),
                    doc(json!({"_kind": "file", "path": "/m/x/b.txt"})),
                    doc(json!({"_kind": "file", "path": "/m/xy/c.txt"})),
                ]))
                .unwrap(),
        );
        let by_path = |path: &str| catalog.find(&Query::of("file").eq("path", path)).unwrap();
        let under = |prefix: &str| {
            catalog
                .find(&Query::of("file").prefix("path", prefix))
                .unwrap()
                .len()
        };

        assert_eq!(by_path("/m/x/a.mp3").len(), 1);
        assert_eq!(under("/m/x/"), 2);
        assert!(catalog
            .find(&Query::of("audio").eq("path", "/m/x/b.txt"))
            .unwrap()
            .is_empty());

        catalog
            .execute(CatalogRequest::Merge(vec![doc(
                json!({"_id": ids[0], "path": "/m/y/a.mp3"}),
            )]))
            .unwrap();
        assert!(by_path("/m/x/a.mp3").is_empty());
        assert_eq!(by_path("/m/y/a.mp3").len(), 1);
        assert_eq!(under("/m/x/"), 1);

        catalog
            .execute(CatalogRequest::Put(vec![doc(
                json!({"_id": ids[1], "_kind": "audio", "path": "/m/x/b.mp3"}),
            )]))
            .unwrap();
        assert!(by_path("/m/x/b.txt").is_empty());
        assert_eq!(catalog.documents("audio").unwrap().len(), 2);

        catalog
            .execute(CatalogRequest::Delete(vec![ids[2].clone()]))
            .unwrap();
        assert!(by_path("/m/xy/c.txt").is_empty());
        assert_eq!(catalog.documents("file").unwrap().len(), 2);
    }

    #[test]
    fn del_kind_clears_its_index_entries() {
        let (_dir, catalog) = catalog();
        catalog
            .execute(CatalogRequest::Put(vec![doc(
                json!({"_kind": "audio", "path": "/m/a.mp3"}),
            )]))
            .unwrap();
        catalog
            .execute(CatalogRequest::DelKind("audio".to_string()))
            .unwrap();
        catalog
            .execute(CatalogRequest::PutKind(KindDefinition::new(
                "audio",
                Some("file"),
            )))
            .unwrap();
        assert!(catalog.documents("audio").unwrap().is_empty());
        assert!(catalog
            .find(&Query::of("file").eq("path", "/m/a.mp3"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reopening_indexes_unindexed_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.redb");
        {
            let catalog = DocumentCatalog::open(&path).unwrap().inline();
            catalog
                .execute(CatalogRequest::PutKind(KindDefinition::new("file", None)))
                .unwrap();
            let write_txn = catalog.db.begin_write().unwrap();
            {
                let mut table = write_txn.open_table(DOCUMENTS_TABLE).unwrap();
                let bytes =
                    serde_json::to_vec(&json!({"_id": "old", "_kind": "file", "path": "/m/o"}))
                        .unwrap();
                table.insert("old", bytes.as_slice()).unwrap();
            }
            write_txn.commit().unwrap();
            assert!(catalog.documents("file").unwrap().is_empty());
        }

        let catalog = DocumentCatalog::open(&path).unwrap().inline();
        assert_eq!(catalog.documents("file").unwrap().len(), 1);
        assert_eq!(
            catalog
                .find(&Query::of("file").eq("path", "/m/o"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn put_kind_requires_its_base() {
        let (_dir, catalog) = catalog();
        let result = catalog.execute(CatalogRequest::PutKind(KindDefinition::new(
            "clip",
            Some("video"),
        )));
        assert_eq!(result, Err(CatalogError::UnknownKind("video".to_string())));
    }

    #[tokio::test]
    async fn blocking_dispatch_replies_through_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = DocumentCatalog::open(&dir.path().join("catalog.redb")).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        catalog.submit(
            CatalogRequest::PutKind(KindDefinition::new("file", None)),
            Reply::new(7, tx),
        );
        match rx.recv().await {
            Some(crate::queue::QueueEvent::Response { id, result }) => {
                assert_eq!(id, 7);
                assert_eq!(result, Ok(CatalogResponse::KindStored));
            }
            _ => panic!("expected a response"),
        }
    }
}
