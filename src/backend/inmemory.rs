//! In-memory backend: the reference implementation of the storage contract.
//!
//! Keeps every collection as an ordered vector of documents behind one
//! process-wide lock. Intended for tests and the bundled binary; it trades
//! lookup speed for deterministic iteration order.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::doc;
use crate::document::Document;
use crate::document::Value;

use super::Backend;
use super::BackendError;
use super::Collection;
use super::CollectionInfo;
use super::Database;
use super::DatabaseInfo;
use super::DeleteAllParams;
use super::DeleteAllResult;
use super::DocumentCursor;
use super::ExplainParams;
use super::ExplainResult;
use super::InsertAllParams;
use super::InsertAllResult;
use super::ListCollectionsParams;
use super::ListCollectionsResult;
use super::ListDatabasesParams;
use super::ListDatabasesResult;
use super::QueryParams;
use super::QueryResult;
use super::UpdateParams;
use super::UpdateResult;

type Collections = BTreeMap<String, Vec<Document>>;

#[derive(Default)]
struct Shared {
    databases: RwLock<BTreeMap<String, Collections>>,
}

/// Thread-safe in-memory [`Backend`].
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn database(&self, name: &str) -> Result<Box<dyn Database>, BackendError> {
        // Handles are cheap and stateless; nothing is created here.
        Ok(Box::new(MemoryDatabase {
            shared: Arc::clone(&self.shared),
            name: name.to_owned(),
        }))
    }

    async fn list_databases(
        &self,
        _token: &CancellationToken,
        _params: &ListDatabasesParams,
    ) -> Result<ListDatabasesResult, BackendError> {
        let databases = self.shared.databases.read();
        let databases = databases
            .iter()
            .map(|(name, collections)| DatabaseInfo {
                name: name.clone(),
                // Encoded byte total, a rough on-disk analogue.
                size: collections
                    .values()
                    .flat_map(|docs| docs.iter())
                    .map(|doc| doc.encode().len() as i64)
                    .sum(),
            })
            .collect();

        Ok(ListDatabasesResult { databases })
    }
}

struct MemoryDatabase {
    shared: Arc<Shared>,
    name: String,
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn collection(&self, name: &str) -> Result<Box<dyn Collection>, BackendError> {
        Ok(Box::new(MemoryCollection {
            shared: Arc::clone(&self.shared),
            database: self.name.clone(),
            name: name.to_owned(),
        }))
    }

    async fn list_collections(
        &self,
        _token: &CancellationToken,
        _params: &ListCollectionsParams,
    ) -> Result<ListCollectionsResult, BackendError> {
        let databases = self.shared.databases.read();
        let collections = databases
            .get(&self.name)
            .map(|collections| {
                collections
                    .keys()
                    .map(|name| CollectionInfo { name: name.clone() })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ListCollectionsResult { collections })
    }
}

struct MemoryCollection {
    shared: Arc<Shared>,
    database: String,
    name: String,
}

impl MemoryCollection {
    fn doc_id(doc: &Document) -> Option<&Value> {
        doc.get("_id")
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    async fn query(
        &self,
        _token: &CancellationToken,
        _params: &QueryParams,
    ) -> Result<QueryResult, BackendError> {
        let databases = self.shared.databases.read();
        let docs: VecDeque<Document> = databases
            .get(&self.database)
            .and_then(|db| db.get(&self.name))
            .map(|docs| docs.iter().cloned().collect())
            .unwrap_or_default();

        Ok(QueryResult {
            iter: DocumentCursor::new(docs),
        })
    }

    async fn insert_all(
        &self,
        _token: &CancellationToken,
        params: &mut InsertAllParams,
    ) -> Result<InsertAllResult, BackendError> {
        let mut databases = self.shared.databases.write();

        // Validate the whole batch against the stored set and against
        // itself before touching anything, so a failure changes nothing,
        // not even the implicit creation of the namespace.
        let stored = databases
            .get(&self.database)
            .and_then(|db| db.get(&self.name))
            .map(|docs| docs.as_slice())
            .unwrap_or(&[]);
        for (i, doc) in params.docs.iter().enumerate() {
            let id = Self::doc_id(doc).ok_or_else(|| {
                BackendError::fault(format!("document {i} has no _id"))
            })?;

            let stored_clash = stored.iter().any(|d| Self::doc_id(d) == Some(id));
            let batch_clash = params.docs[..i]
                .iter()
                .any(|d| Self::doc_id(d) == Some(id));
            if stored_clash || batch_clash {
                return Err(BackendError::InsertDuplicateId { id: id.to_string() });
            }
        }

        databases
            .entry(self.database.clone())
            .or_default()
            .entry(self.name.clone())
            .or_default()
            .extend(params.docs.iter().cloned());
        Ok(InsertAllResult {})
    }

    async fn update(
        &self,
        _token: &CancellationToken,
        params: &UpdateParams,
    ) -> Result<UpdateResult, BackendError> {
        let mut databases = self.shared.databases.write();
        let Some(docs) = databases
            .get_mut(&self.database)
            .and_then(|db| db.get_mut(&self.name))
        else {
            return Ok(UpdateResult { updated: 0 });
        };

        let mut updated = 0;
        for replacement in &params.docs {
            let Some(id) = Self::doc_id(replacement) else {
                continue;
            };
            if let Some(stored) = docs.iter_mut().find(|d| Self::doc_id(d) == Some(id)) {
                *stored = replacement.clone();
                updated += 1;
            }
        }
        Ok(UpdateResult { updated })
    }

    async fn delete_all(
        &self,
        _token: &CancellationToken,
        params: &DeleteAllParams,
    ) -> Result<DeleteAllResult, BackendError> {
        let mut databases = self.shared.databases.write();
        let Some(docs) = databases
            .get_mut(&self.database)
            .and_then(|db| db.get_mut(&self.name))
        else {
            return Ok(DeleteAllResult { deleted: 0 });
        };

        let mut deleted = 0;
        for id in &params.ids {
            if let Some(at) = docs.iter().position(|d| Self::doc_id(d) == Some(id)) {
                docs.remove(at);
                deleted += 1;
            }
        }
        Ok(DeleteAllResult { deleted })
    }

    async fn explain(
        &self,
        _token: &CancellationToken,
        _params: &ExplainParams,
    ) -> Result<ExplainResult, BackendError> {
        let databases = self.shared.databases.read();
        let documents = databases
            .get(&self.database)
            .and_then(|db| db.get(&self.name))
            .map(|docs| docs.len() as i64)
            .unwrap_or(0);

        Ok(ExplainResult {
            query_planner: doc! {
                "namespace" => Value::String(format!("{}.{}", self.database, self.name)),
                "plan" => Value::String("COLLSCAN".to_owned()),
                "documents" => Value::Int64(documents),
            },
        })
    }
}
