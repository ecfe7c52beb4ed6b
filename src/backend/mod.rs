//! Storage contract: the Backend → Database → Collection surface that
//! command handlers call.
//!
//! Handlers never talk to an implementation directly. Every implementation
//! is wrapped in a contract type ([`BackendContract`], [`DatabaseContract`],
//! [`CollectionContract`]) that opens a tracing span per operation, applies
//! input preconditions, and verifies that returned errors are drawn from
//! the operation's allowed set. An unexpected kind is a programmer bug in
//! the backend and surfaces as [`BackendError::Unexpected`].
//!
//! Handles are stateless and temporary: creating a [`Database`] or
//! [`Collection`] handle never creates persistent state, handles are cheap
//! to create and discard, and dropping one releases whatever it held.

mod cursor;
mod error;

pub mod inmemory;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::document::Document;
use crate::document::Value;

pub use cursor::CursorCloseHandle;
pub use cursor::DocumentCursor;
pub use cursor::DocumentStream;
pub use error::BackendError;
pub use error::ErrorKind;

use error::check_error;

/// Process-wide storage handle. Implementations must be thread-safe; one
/// backend is shared by every connection.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a handle to the named database.
    ///
    /// May fail with [`BackendError::DatabaseNameIsInvalid`]. Opening a
    /// handle does not create the database.
    async fn database(&self, name: &str) -> Result<Box<dyn Database>, BackendError>;

    /// Enumerate existing databases, ordered by name.
    async fn list_databases(
        &self,
        token: &CancellationToken,
        params: &ListDatabasesParams,
    ) -> Result<ListDatabasesResult, BackendError>;
}

impl std::fmt::Debug for dyn Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Database")
    }
}

/// Stateless handle to one database, keyed by name. Dropping the handle
/// releases it; all durable state lives in the backend.
#[async_trait]
pub trait Database: Send + Sync {
    /// Open a handle to the named collection.
    ///
    /// May fail with [`BackendError::CollectionNameIsInvalid`]. Opening a
    /// handle does not create the collection.
    async fn collection(&self, name: &str) -> Result<Box<dyn Collection>, BackendError>;

    /// Enumerate existing collections, ordered by name.
    ///
    /// A database that does not exist is never an error: the result is
    /// empty.
    async fn list_collections(
        &self,
        token: &CancellationToken,
        params: &ListCollectionsParams,
    ) -> Result<ListCollectionsResult, BackendError>;
}

impl std::fmt::Debug for dyn Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Collection")
    }
}

/// Stateless handle to one collection, keyed by (database, name).
///
/// For `query`, `update`, `delete_all`, and `explain`, a missing database
/// or collection is never an error: the operation behaves as if run against
/// an empty set.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Execute a query and return a cursor over its documents.
    async fn query(
        &self,
        token: &CancellationToken,
        params: &QueryParams,
    ) -> Result<QueryResult, BackendError>;

    /// Insert all documents or none.
    ///
    /// Atomic: on partial failure the operation rolls back and the first
    /// error is returned. Documents are valid and carry `_id` fields; the
    /// contract freezes them before they reach the implementation. Database
    /// and collection are created if needed.
    async fn insert_all(
        &self,
        token: &CancellationToken,
        params: &mut InsertAllParams,
    ) -> Result<InsertAllResult, BackendError>;

    /// Replace stored documents by `_id` and report how many changed.
    async fn update(
        &self,
        token: &CancellationToken,
        params: &UpdateParams,
    ) -> Result<UpdateResult, BackendError>;

    /// Delete documents by `_id` and report how many went away.
    ///
    /// Atomic; the id set may contain duplicates or ids that match nothing.
    async fn delete_all(
        &self,
        token: &CancellationToken,
        params: &DeleteAllParams,
    ) -> Result<DeleteAllResult, BackendError>;

    /// The backend's execution plan for a query.
    async fn explain(
        &self,
        token: &CancellationToken,
        params: &ExplainParams,
    ) -> Result<ExplainResult, BackendError>;
}

/// Parameters of [`Backend::list_databases`]. Reserved: no filtering yet.
#[derive(Debug, Default)]
pub struct ListDatabasesParams {}

/// Result of [`Backend::list_databases`].
#[derive(Debug, Default)]
pub struct ListDatabasesResult {
    /// Existing databases, ordered by name.
    pub databases: Vec<DatabaseInfo>,
}

/// Summary of one existing database.
#[derive(Clone, Debug, Default)]
pub struct DatabaseInfo {
    /// The database name.
    pub name: String,
    /// Stored size in bytes, as the backend accounts for it.
    pub size: i64,
}

/// Parameters of [`Database::list_collections`]. Reserved: no filtering yet.
#[derive(Debug, Default)]
pub struct ListCollectionsParams {}

/// Result of [`Database::list_collections`].
#[derive(Debug, Default)]
pub struct ListCollectionsResult {
    /// Existing collections, ordered by name.
    pub collections: Vec<CollectionInfo>,
}

/// Summary of one existing collection.
#[derive(Clone, Debug, Default)]
pub struct CollectionInfo {
    /// The collection name.
    pub name: String,
}

/// Parameters of [`Collection::query`]. Reserved: no pushdowns yet.
#[derive(Debug, Default)]
pub struct QueryParams {}

/// Result of [`Collection::query`].
pub struct QueryResult {
    /// Cursor over the matching documents. The caller owns closing it,
    /// normally via a request-scoped `MultiCloser`.
    pub iter: DocumentCursor,
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult").finish_non_exhaustive()
    }
}

/// Parameters of [`Collection::insert_all`].
#[derive(Debug, Default)]
pub struct InsertAllParams {
    /// Documents to insert, in order. Each carries an `_id`.
    pub docs: Vec<Document>,
}

/// Result of [`Collection::insert_all`]: empty, the batch either fully
/// succeeded or was rolled back.
#[derive(Debug, Default)]
pub struct InsertAllResult {}

/// Parameters of [`Collection::update`].
#[derive(Debug, Default)]
pub struct UpdateParams {
    /// Replacement documents, matched to stored ones by `_id`.
    pub docs: Vec<Document>,
}

/// Result of [`Collection::update`].
#[derive(Debug, Default)]
pub struct UpdateResult {
    /// Number of documents that were replaced.
    pub updated: i32,
}

/// Parameters of [`Collection::delete_all`].
#[derive(Debug, Default)]
pub struct DeleteAllParams {
    /// `_id` values to delete. Duplicates and misses are permitted.
    pub ids: Vec<Value>,
}

/// Result of [`Collection::delete_all`].
#[derive(Debug, Default)]
pub struct DeleteAllResult {
    /// Number of documents deleted.
    pub deleted: i32,
}

/// Parameters of [`Collection::explain`]. Reserved: no pushdowns yet.
#[derive(Debug, Default)]
pub struct ExplainParams {}

/// Result of [`Collection::explain`].
#[derive(Debug, Default)]
pub struct ExplainResult {
    /// The backend's query planner document.
    pub query_planner: Document,
}

/// Contract wrapper for a [`Backend`] implementation.
///
/// Validates database names before the implementation sees them and wraps
/// every handle it returns in the corresponding contract type.
pub struct BackendContract {
    inner: Box<dyn Backend>,
}

impl BackendContract {
    /// Wrap an implementation. All consumers should hold the wrapper, never
    /// the implementation.
    pub fn new(inner: impl Backend + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

#[async_trait]
impl Backend for BackendContract {
    #[instrument(name = "backend.database", skip(self))]
    async fn database(&self, name: &str) -> Result<Box<dyn Database>, BackendError> {
        validate_database_name(name)?;
        let db = self
            .inner
            .database(name)
            .await
            .map_err(|err| check_error("database", err, &[ErrorKind::DatabaseNameIsInvalid]))?;
        Ok(Box::new(DatabaseContract { inner: db }))
    }

    #[instrument(name = "backend.list_databases", skip_all)]
    async fn list_databases(
        &self,
        token: &CancellationToken,
        params: &ListDatabasesParams,
    ) -> Result<ListDatabasesResult, BackendError> {
        self.inner
            .list_databases(token, params)
            .await
            .map_err(|err| check_error("list_databases", err, &[]))
    }
}

/// Contract wrapper for a [`Database`] handle.
pub struct DatabaseContract {
    inner: Box<dyn Database>,
}

#[async_trait]
impl Database for DatabaseContract {
    #[instrument(name = "database.collection", skip(self))]
    async fn collection(&self, name: &str) -> Result<Box<dyn Collection>, BackendError> {
        validate_collection_name(name)?;
        let coll = self
            .inner
            .collection(name)
            .await
            .map_err(|err| check_error("collection", err, &[ErrorKind::CollectionNameIsInvalid]))?;
        Ok(Box::new(CollectionContract { inner: coll }))
    }

    #[instrument(name = "database.list_collections", skip_all)]
    async fn list_collections(
        &self,
        token: &CancellationToken,
        params: &ListCollectionsParams,
    ) -> Result<ListCollectionsResult, BackendError> {
        self.inner
            .list_collections(token, params)
            .await
            .map_err(|err| check_error("list_collections", err, &[]))
    }
}

/// Contract wrapper for a [`Collection`] handle.
pub struct CollectionContract {
    inner: Box<dyn Collection>,
}

#[async_trait]
impl Collection for CollectionContract {
    #[instrument(name = "collection.query", skip_all)]
    async fn query(
        &self,
        token: &CancellationToken,
        params: &QueryParams,
    ) -> Result<QueryResult, BackendError> {
        self.inner
            .query(token, params)
            .await
            .map_err(|err| check_error("query", err, &[]))
    }

    #[instrument(name = "collection.insert_all", skip_all, fields(docs = params.docs.len()))]
    async fn insert_all(
        &self,
        token: &CancellationToken,
        params: &mut InsertAllParams,
    ) -> Result<InsertAllResult, BackendError> {
        // Precondition: the implementation must never observe a document
        // that can still change. Freezing happens whether or not the insert
        // later fails.
        for doc in &mut params.docs {
            doc.freeze();
        }

        self.inner
            .insert_all(token, params)
            .await
            .map_err(|err| check_error("insert_all", err, &[ErrorKind::InsertDuplicateId]))
    }

    #[instrument(name = "collection.update", skip_all, fields(docs = params.docs.len()))]
    async fn update(
        &self,
        token: &CancellationToken,
        params: &UpdateParams,
    ) -> Result<UpdateResult, BackendError> {
        self.inner
            .update(token, params)
            .await
            .map_err(|err| check_error("update", err, &[]))
    }

    #[instrument(name = "collection.delete_all", skip_all, fields(ids = params.ids.len()))]
    async fn delete_all(
        &self,
        token: &CancellationToken,
        params: &DeleteAllParams,
    ) -> Result<DeleteAllResult, BackendError> {
        self.inner
            .delete_all(token, params)
            .await
            .map_err(|err| check_error("delete_all", err, &[]))
    }

    #[instrument(name = "collection.explain", skip_all)]
    async fn explain(
        &self,
        token: &CancellationToken,
        params: &ExplainParams,
    ) -> Result<ExplainResult, BackendError> {
        self.inner
            .explain(token, params)
            .await
            .map_err(|err| check_error("explain", err, &[]))
    }
}

const MAX_NAME_LEN: usize = 255;

fn validate_database_name(name: &str) -> Result<(), BackendError> {
    let invalid = name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.bytes().any(|b| b == 0)
        || name.chars().any(|c| {
            matches!(c, '/' | '\\' | '.' | '"' | '$') || c.is_whitespace()
        });
    if invalid {
        return Err(BackendError::DatabaseNameIsInvalid {
            name: name.to_owned(),
        });
    }
    Ok(())
}

fn validate_collection_name(name: &str) -> Result<(), BackendError> {
    let invalid = name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.bytes().any(|b| b == 0)
        || name.contains('$')
        || name.starts_with('.');
    if invalid {
        return Err(BackendError::CollectionNameIsInvalid {
            name: name.to_owned(),
        });
    }
    Ok(())
}
