//! Bundled handler implementation over the storage contract.
//!
//! Implements a small command surface: diagnostics (`ping`, `hello`,
//! `buildInfo`, `listCommands`, `getLog`) and the storage commands needed
//! to exercise every contract operation (`insert`, `find`, `distinct`,
//! `explain`, `delete`). Query-operator evaluation is deliberately absent:
//! filters other than `{}` are rejected as not implemented.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;

use crate::backend::Backend;
use crate::backend::BackendContract;
use crate::backend::BackendError;
use crate::backend::Collection;
use crate::backend::DeleteAllParams;
use crate::backend::ErrorKind;
use crate::backend::ExplainParams;
use crate::backend::InsertAllParams;
use crate::backend::ListCollectionsParams;
use crate::backend::ListDatabasesParams;
use crate::backend::QueryParams;
use crate::command::COMMANDS;
use crate::doc;
use crate::document::Array;
use crate::document::Document;
use crate::document::ObjectId;
use crate::document::Value;
use crate::error::CommandError;
use crate::error::ErrorCode;
use crate::error::ProtocolError;
use crate::error::WriteErrors;
use crate::util::MultiCloser;
use crate::wire::OpMsg;
use crate::wire::OpQuery;
use crate::wire::OpReply;

use super::Handler;
use super::RequestContext;

/// Largest document the handshake advertises, in bytes.
const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;
/// Largest message the handshake advertises, in bytes.
const MAX_MESSAGE_SIZE_BYTES: i32 = crate::wire::MAX_MESSAGE_LEN;
/// Largest write batch the handshake advertises.
const MAX_WRITE_BATCH_SIZE: i32 = 100_000;
/// Advertised wire-protocol version range.
const MIN_WIRE_VERSION: i32 = 0;
/// Advertised wire-protocol version range.
const MAX_WIRE_VERSION: i32 = 21;
/// Compatible server version advertised by `buildInfo` and `explain`.
const COMPAT_VERSION: &str = "7.0.0";

/// [`Handler`] over a contract-wrapped storage backend.
pub struct BackendHandler {
    backend: BackendContract,
}

impl BackendHandler {
    /// Wrap a backend implementation. The handler owns the contract
    /// wrapper; callers hand in the bare implementation.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: BackendContract::new(backend),
        }
    }

    async fn open_collection(
        &self,
        db: &str,
        coll: &str,
        command: &str,
    ) -> Result<Box<dyn Collection>, ProtocolError> {
        let database = self.backend.database(db).await.map_err(|err| {
            if err.kind() == ErrorKind::DatabaseNameIsInvalid {
                ProtocolError::from(
                    CommandError::new(
                        ErrorCode::InvalidNamespace,
                        format!("Invalid namespace specified '{db}.{coll}'"),
                    )
                    .with_argument(command.to_owned()),
                )
            } else {
                ProtocolError::from(err)
            }
        })?;

        database.collection(coll).await.map_err(|err| {
            if err.kind() == ErrorKind::CollectionNameIsInvalid {
                CommandError::new(
                    ErrorCode::InvalidNamespace,
                    format!("Invalid collection name: {coll}"),
                )
                .with_argument(command.to_owned())
                .into()
            } else {
                err.into()
            }
        })
    }
}

#[async_trait]
impl Handler for BackendHandler {
    async fn msg_ping(&self, _cx: &RequestContext, _msg: &OpMsg) -> Result<OpMsg, ProtocolError> {
        Ok(OpMsg::new(doc! {"ok" => Value::Double(1.0)}))
    }

    async fn msg_hello(&self, _cx: &RequestContext, _msg: &OpMsg) -> Result<OpMsg, ProtocolError> {
        Ok(OpMsg::new(hello_doc()))
    }

    async fn msg_build_info(
        &self,
        _cx: &RequestContext,
        _msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError> {
        let mut version_array = Array::new();
        for part in [7, 0, 0, 0] {
            version_array.push(Value::Int32(part));
        }

        Ok(OpMsg::new(doc! {
            "version" => Value::String(COMPAT_VERSION.to_owned()),
            "versionArray" => Value::Array(version_array),
            "bits" => Value::Int32(64),
            "debug" => Value::Bool(false),
            "maxBsonObjectSize" => Value::Int32(MAX_BSON_OBJECT_SIZE),
            "larchVersion" => Value::String(env!("CARGO_PKG_VERSION").to_owned()),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn msg_list_commands(
        &self,
        _cx: &RequestContext,
        _msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError> {
        let mut commands = Document::new();
        for (name, cmd) in COMMANDS.iter() {
            commands.set(
                *name,
                Value::Document(doc! {"help" => Value::String(cmd.help.to_owned())}),
            );
        }

        Ok(OpMsg::new(doc! {
            "commands" => Value::Document(commands),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn msg_get_log(
        &self,
        _cx: &RequestContext,
        msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError> {
        let document = msg.document();
        let response = match document.get("getLog") {
            Some(Value::String(name)) if name == "*" => {
                let mut names = Array::new();
                names.push(Value::String("startupWarnings".to_owned()));
                doc! {
                    "names" => Value::Array(names),
                    "ok" => Value::Double(1.0),
                }
            }
            Some(Value::String(name)) if name == "startupWarnings" => doc! {
                "totalLinesWritten" => Value::Int32(0),
                "log" => Value::Array(Array::new()),
                "ok" => Value::Double(1.0),
            },
            Some(Value::String(name)) => {
                return Err(CommandError::new(
                    ErrorCode::BadValue,
                    format!("no RamLog named: {name}"),
                )
                .with_argument("getLog")
                .into());
            }
            _ => {
                return Err(CommandError::new(
                    ErrorCode::TypeMismatch,
                    "Argument to getLog must be of type String",
                )
                .with_argument("getLog")
                .into());
            }
        };

        Ok(OpMsg::new(response))
    }

    async fn msg_list_databases(
        &self,
        cx: &RequestContext,
        _msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError> {
        let res = self
            .backend
            .list_databases(&cx.token, &ListDatabasesParams::default())
            .await
            .map_err(ProtocolError::from)?;

        let mut total_size = 0i64;
        let mut databases = Array::new();
        for info in res.databases {
            total_size += info.size;
            databases.push(Value::Document(doc! {
                "name" => Value::String(info.name),
                "sizeOnDisk" => Value::Int64(info.size),
                "empty" => Value::Bool(info.size == 0),
            }));
        }

        Ok(OpMsg::new(doc! {
            "databases" => Value::Array(databases),
            "totalSize" => Value::Int64(total_size),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn msg_list_collections(
        &self,
        cx: &RequestContext,
        msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError> {
        let document = msg.document();
        let db = get_db(document)?;

        let database = self.backend.database(&db).await.map_err(|err| {
            if err.kind() == ErrorKind::DatabaseNameIsInvalid {
                ProtocolError::from(
                    CommandError::new(
                        ErrorCode::InvalidNamespace,
                        format!("Invalid database name: {db}"),
                    )
                    .with_argument("$db"),
                )
            } else {
                ProtocolError::from(err)
            }
        })?;

        let res = database
            .list_collections(&cx.token, &ListCollectionsParams::default())
            .await
            .map_err(ProtocolError::from)?;

        let mut first_batch = Array::new();
        for info in res.collections {
            first_batch.push(Value::Document(doc! {
                "name" => Value::String(info.name),
                "type" => Value::String("collection".to_owned()),
            }));
        }

        Ok(OpMsg::new(doc! {
            "cursor" => Value::Document(doc! {
                "firstBatch" => Value::Array(first_batch),
                "id" => Value::Int64(0),
                "ns" => Value::String(format!("{db}.$cmd.listCollections")),
            }),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn msg_host_info(
        &self,
        _cx: &RequestContext,
        _msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError> {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(1);

        Ok(OpMsg::new(doc! {
            "system" => Value::Document(doc! {
                "currentTime" => Value::DateTime(current_time_millis()),
                "hostname" => Value::String(hostname),
                "cpuAddrSize" => Value::Int32(64),
                "numCores" => Value::Int32(cores),
                "cpuArch" => Value::String(std::env::consts::ARCH.to_owned()),
            }),
            "os" => Value::Document(doc! {
                "type" => Value::String(std::env::consts::OS.to_owned()),
            }),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn msg_whats_my_uri(
        &self,
        cx: &RequestContext,
        _msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError> {
        let you = cx
            .peer_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        Ok(OpMsg::new(doc! {
            "you" => Value::String(you),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn msg_connection_status(
        &self,
        _cx: &RequestContext,
        _msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError> {
        // No authentication is enforced by the core; the connection is
        // reported as unauthenticated.
        Ok(OpMsg::new(doc! {
            "authInfo" => Value::Document(doc! {
                "authenticatedUsers" => Value::Array(Array::new()),
                "authenticatedUserRoles" => Value::Array(Array::new()),
            }),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn msg_insert(&self, cx: &RequestContext, msg: &OpMsg) -> Result<OpMsg, ProtocolError> {
        let document = msg.document();
        let db = get_db(document)?;
        let coll = get_collection_name(document)?;

        let mut docs = insert_documents(msg)?;
        for doc in &mut docs {
            if doc.get("_id").is_none() {
                doc.set("_id", Value::ObjectId(ObjectId::new()));
            }
        }

        let ordered = match document.get("ordered") {
            Some(Value::Bool(ordered)) => *ordered,
            _ => true,
        };

        let collection = self.open_collection(&db, &coll, "insert").await?;

        // The contract's insert_all is all-or-nothing per call; per-document
        // write errors are produced by inserting one batch of one at a time.
        let mut inserted = 0i32;
        let mut write_errors = WriteErrors::new();
        for (i, doc) in docs.into_iter().enumerate() {
            let mut params = InsertAllParams { docs: vec![doc] };
            match collection.insert_all(&cx.token, &mut params).await {
                Ok(_) => inserted += 1,
                Err(BackendError::InsertDuplicateId { id }) => {
                    write_errors.push(
                        i as i32,
                        ErrorCode::DuplicateKey,
                        format!("E11000 duplicate key error: _id: {id}"),
                    );
                    if ordered {
                        break;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut response = doc! {"n" => Value::Int32(inserted)};
        if !write_errors.is_empty() {
            response.set("writeErrors", Value::Array(write_errors.to_array()));
        }
        response.set("ok", Value::Double(1.0));
        Ok(OpMsg::new(response))
    }

    async fn msg_find(&self, cx: &RequestContext, msg: &OpMsg) -> Result<OpMsg, ProtocolError> {
        let document = msg.document();
        let db = get_db(document)?;
        let coll = get_collection_name(document)?;
        reject_filter(document, "find")?;

        let collection = self.open_collection(&db, &coll, "find").await?;

        let mut closer = MultiCloser::new();
        let mut res = collection
            .query(&cx.token, &QueryParams::default())
            .await
            .map_err(ProtocolError::from)?;
        closer.add(res.iter.close_handle());

        let mut first_batch = Array::new();
        for doc in res.iter.collect_remaining().map_err(ProtocolError::from)? {
            first_batch.push(Value::Document(doc));
        }

        Ok(OpMsg::new(doc! {
            "cursor" => Value::Document(doc! {
                "firstBatch" => Value::Array(first_batch),
                "id" => Value::Int64(0),
                "ns" => Value::String(format!("{db}.{coll}")),
            }),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn msg_distinct(
        &self,
        cx: &RequestContext,
        msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError> {
        let document = msg.document();
        let db = get_db(document)?;
        let coll = get_collection_name(document)?;
        reject_filter(document, "distinct")?;

        let key = match document.get("key") {
            Some(Value::String(key)) if !key.is_empty() => key.clone(),
            Some(Value::String(_)) => {
                return Err(CommandError::new(
                    ErrorCode::BadValue,
                    "distinct key cannot be an empty string",
                )
                .with_argument("key")
                .into());
            }
            _ => {
                return Err(CommandError::new(
                    ErrorCode::TypeMismatch,
                    "\"key\" had the wrong type, expected string",
                )
                .with_argument("key")
                .into());
            }
        };

        let collection = self.open_collection(&db, &coll, "distinct").await?;

        let mut closer = MultiCloser::new();
        let mut res = collection
            .query(&cx.token, &QueryParams::default())
            .await
            .map_err(ProtocolError::from)?;
        closer.add(res.iter.close_handle());

        let mut values: Vec<Value> = Vec::new();
        let mut add = |value: &Value| {
            if !values.contains(value) {
                values.push(value.clone());
            }
        };
        for doc in res.iter.collect_remaining().map_err(ProtocolError::from)? {
            match doc.get(&key) {
                // Array members contribute individually, as the reference
                // server does for distinct.
                Some(Value::Array(arr)) => arr.iter().for_each(&mut add),
                Some(value) => add(value),
                None => {}
            }
        }

        Ok(OpMsg::new(doc! {
            "values" => Value::Array(values.into_iter().collect()),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn msg_explain(&self, cx: &RequestContext, msg: &OpMsg) -> Result<OpMsg, ProtocolError> {
        let document = msg.document();
        let db = get_db(document)?;

        let mut command = match document.get("explain") {
            Some(Value::Document(inner)) => inner.clone(),
            _ => {
                return Err(CommandError::new(
                    ErrorCode::TypeMismatch,
                    "Argument to explain must be of type Object",
                )
                .with_argument("explain")
                .into());
            }
        };

        let coll = match command.iter().next() {
            Some((_, Value::String(coll))) => coll.clone(),
            _ => {
                return Err(CommandError::new(
                    ErrorCode::BadValue,
                    "explain requires a collection-bearing command",
                )
                .with_argument("explain")
                .into());
            }
        };
        command.set("$db", Value::String(db.clone()));

        let collection = self.open_collection(&db, &coll, "explain").await?;
        let res = collection
            .explain(&cx.token, &ExplainParams::default())
            .await
            .map_err(ProtocolError::from)?;

        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());

        Ok(OpMsg::new(doc! {
            "queryPlanner" => Value::Document(res.query_planner),
            "explainVersion" => Value::String("1".to_owned()),
            "command" => Value::Document(command),
            "serverInfo" => Value::Document(doc! {
                "host" => Value::String(host),
                "version" => Value::String(COMPAT_VERSION.to_owned()),
                "larchVersion" => Value::String(env!("CARGO_PKG_VERSION").to_owned()),
            }),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn msg_delete(&self, cx: &RequestContext, msg: &OpMsg) -> Result<OpMsg, ProtocolError> {
        let document = msg.document();
        let db = get_db(document)?;
        let coll = get_collection_name(document)?;

        let deletes = match document.get("deletes") {
            Some(Value::Array(deletes)) => deletes,
            _ => {
                return Err(CommandError::new(
                    ErrorCode::TypeMismatch,
                    "\"deletes\" had the wrong type, expected array",
                )
                .with_argument("deletes")
                .into());
            }
        };

        let collection = self.open_collection(&db, &coll, "delete").await?;

        let mut ids = Vec::new();
        for stmt in deletes.iter() {
            let Value::Document(stmt) = stmt else {
                return Err(CommandError::new(
                    ErrorCode::TypeMismatch,
                    "delete statements must be objects",
                )
                .with_argument("deletes")
                .into());
            };

            match stmt.get("q") {
                Some(Value::Document(q)) if q.is_empty() => {
                    // Delete everything: collect the stored ids first.
                    let mut closer = MultiCloser::new();
                    let mut res = collection
                        .query(&cx.token, &QueryParams::default())
                        .await
                        .map_err(ProtocolError::from)?;
                    closer.add(res.iter.close_handle());

                    for doc in res.iter.collect_remaining().map_err(ProtocolError::from)? {
                        if let Some(id) = doc.get("_id") {
                            ids.push(id.clone());
                        }
                    }
                }
                Some(Value::Document(q)) if q.len() == 1 && q.get("_id").is_some() => {
                    ids.push(q.get("_id").cloned().unwrap_or(Value::Null));
                }
                Some(Value::Document(_)) => {
                    return Err(CommandError::new(
                        ErrorCode::NotImplemented,
                        "delete filters beyond _id equality are not supported",
                    )
                    .with_argument("deletes")
                    .into());
                }
                _ => {
                    return Err(CommandError::new(
                        ErrorCode::TypeMismatch,
                        "\"q\" had the wrong type, expected object",
                    )
                    .with_argument("deletes")
                    .into());
                }
            }
        }

        let res = collection
            .delete_all(&cx.token, &DeleteAllParams { ids })
            .await
            .map_err(ProtocolError::from)?;

        Ok(OpMsg::new(doc! {
            "n" => Value::Int32(res.deleted),
            "ok" => Value::Double(1.0),
        }))
    }

    async fn cmd_query(
        &self,
        _cx: &RequestContext,
        query: &OpQuery,
    ) -> Result<OpReply, ProtocolError> {
        let command = query.query.command();
        if query.full_collection_name.ends_with(".$cmd")
            && matches!(command, "hello" | "isMaster" | "ismaster")
        {
            return Ok(OpReply::with_document(hello_doc()));
        }

        Err(CommandError::new(
            ErrorCode::NotImplemented,
            format!("OP_QUERY command '{command}' is not supported"),
        )
        .with_argument(command.to_owned())
        .into())
    }
}

fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn hello_doc() -> Document {
    let now = current_time_millis();

    doc! {
        "isWritablePrimary" => Value::Bool(true),
        "ismaster" => Value::Bool(true),
        "helloOk" => Value::Bool(true),
        "maxBsonObjectSize" => Value::Int32(MAX_BSON_OBJECT_SIZE),
        "maxMessageSizeBytes" => Value::Int32(MAX_MESSAGE_SIZE_BYTES),
        "maxWriteBatchSize" => Value::Int32(MAX_WRITE_BATCH_SIZE),
        "localTime" => Value::DateTime(now),
        "minWireVersion" => Value::Int32(MIN_WIRE_VERSION),
        "maxWireVersion" => Value::Int32(MAX_WIRE_VERSION),
        "readOnly" => Value::Bool(false),
        "ok" => Value::Double(1.0),
    }
}

fn get_db(document: &Document) -> Result<String, ProtocolError> {
    match document.get("$db") {
        Some(Value::String(db)) => Ok(db.clone()),
        _ => Err(CommandError::new(
            ErrorCode::FailedToParse,
            "required field \"$db\" is missing or not a string",
        )
        .with_argument("$db")
        .into()),
    }
}

fn get_collection_name(document: &Document) -> Result<String, ProtocolError> {
    match document.get(document.command()) {
        Some(Value::String(coll)) => Ok(coll.clone()),
        _ => Err(CommandError::new(
            ErrorCode::TypeMismatch,
            "collection name has invalid type",
        )
        .with_argument(document.command().to_owned())
        .into()),
    }
}

// Filters require operator evaluation, which this handler does not do.
fn reject_filter(document: &Document, command: &str) -> Result<(), ProtocolError> {
    match document.get("filter") {
        None => Ok(()),
        Some(Value::Document(filter)) if filter.is_empty() => Ok(()),
        Some(_) => Err(CommandError::new(
            ErrorCode::NotImplemented,
            format!("{command} filters are not supported"),
        )
        .with_argument("filter")
        .into()),
    }
}

fn insert_documents(msg: &OpMsg) -> Result<Vec<Document>, ProtocolError> {
    if let Some(docs) = msg.sequence("documents") {
        return Ok(docs.to_vec());
    }

    match msg.document().get("documents") {
        Some(Value::Array(array)) => {
            let mut docs = Vec::with_capacity(array.len());
            for value in array.iter() {
                match value {
                    Value::Document(doc) => docs.push(doc.clone()),
                    _ => {
                        return Err(CommandError::new(
                            ErrorCode::TypeMismatch,
                            "\"documents\" members must be objects",
                        )
                        .with_argument("documents")
                        .into());
                    }
                }
            }
            Ok(docs)
        }
        _ => Err(CommandError::new(
            ErrorCode::BadValue,
            "required field \"documents\" is missing",
        )
        .with_argument("documents")
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::inmemory::MemoryBackend;
    use crate::wire::Section;

    fn handler() -> BackendHandler {
        BackendHandler::new(MemoryBackend::new())
    }

    fn msg(document: Document) -> OpMsg {
        OpMsg::new(document)
    }

    fn ok_of(response: &OpMsg) -> f64 {
        match response.document().get("ok") {
            Some(Value::Double(ok)) => *ok,
            other => panic!("missing ok field: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_pongs() {
        let h = handler();
        let cx = RequestContext::detached();
        let res = h
            .msg_ping(&cx, &msg(doc! {"ping" => Value::Int32(1)}))
            .await
            .unwrap();
        assert_eq!(ok_of(&res), 1.0);
    }

    #[tokio::test]
    async fn hello_advertises_limits() {
        let h = handler();
        let cx = RequestContext::detached();
        let res = h
            .msg_hello(&cx, &msg(doc! {"hello" => Value::Int32(1)}))
            .await
            .unwrap();
        let d = res.document();
        assert_eq!(d.get("isWritablePrimary"), Some(&Value::Bool(true)));
        assert_eq!(
            d.get("maxMessageSizeBytes"),
            Some(&Value::Int32(MAX_MESSAGE_SIZE_BYTES))
        );
    }

    #[tokio::test]
    async fn insert_then_find_roundtrip() {
        let h = handler();
        let cx = RequestContext::detached();

        let insert = OpMsg::with_sections(vec![
            Section::Document(doc! {
                "insert" => Value::String("items".into()),
                "$db" => Value::String("test".into()),
            }),
            Section::Sequence {
                identifier: "documents".into(),
                documents: vec![
                    doc! {"_id" => Value::Int32(1), "v" => Value::String("a".into())},
                    doc! {"v" => Value::String("b".into())}, // _id assigned
                ],
            },
        ])
        .unwrap();

        let res = h.msg_insert(&cx, &insert).await.unwrap();
        assert_eq!(ok_of(&res), 1.0);
        assert_eq!(res.document().get("n"), Some(&Value::Int32(2)));

        let find = msg(doc! {
            "find" => Value::String("items".into()),
            "$db" => Value::String("test".into()),
        });
        let res = h.msg_find(&cx, &find).await.unwrap();
        let d = res.document();
        let Some(Value::Document(cursor)) = d.get("cursor") else {
            panic!("missing cursor");
        };
        assert_eq!(cursor.get("id"), Some(&Value::Int64(0)));
        assert_eq!(
            cursor.get("ns"),
            Some(&Value::String("test.items".into()))
        );
        let Some(Value::Array(batch)) = cursor.get("firstBatch") else {
            panic!("missing firstBatch");
        };
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_insert_reports_write_error() {
        let h = handler();
        let cx = RequestContext::detached();

        let insert = |ids: Vec<i32>| {
            let mut documents = Array::new();
            for id in ids {
                documents.push(Value::Document(doc! {"_id" => Value::Int32(id)}));
            }
            msg(doc! {
                "insert" => Value::String("items".into()),
                "documents" => Value::Array(documents),
                "$db" => Value::String("test".into()),
            })
        };

        h.msg_insert(&cx, &insert(vec![1])).await.unwrap();

        let res = h.msg_insert(&cx, &insert(vec![2, 1, 3])).await.unwrap();
        let d = res.document();
        // Ordered insert stops at the duplicate.
        assert_eq!(d.get("n"), Some(&Value::Int32(1)));
        let Some(Value::Array(errors)) = d.get("writeErrors") else {
            panic!("missing writeErrors");
        };
        assert_eq!(errors.len(), 1);
        let Some(Value::Document(first)) = errors.get(0) else {
            panic!("writeErrors member must be a document");
        };
        assert_eq!(first.get("index"), Some(&Value::Int32(1)));
        assert_eq!(first.get("code"), Some(&Value::Int32(11000)));
    }

    #[tokio::test]
    async fn find_rejects_filters() {
        let h = handler();
        let cx = RequestContext::detached();
        let find = msg(doc! {
            "find" => Value::String("items".into()),
            "filter" => Value::Document(doc! {"v" => Value::Int32(1)}),
            "$db" => Value::String("test".into()),
        });
        let err = h.msg_find(&cx, &find).await.unwrap_err();
        assert_eq!(err.result_label(), "NotImplemented");
    }

    #[tokio::test]
    async fn distinct_flattens_and_dedupes() {
        let h = handler();
        let cx = RequestContext::detached();

        let mut documents = Array::new();
        let mut tags = Array::new();
        tags.push(Value::String("a".into()));
        tags.push(Value::String("b".into()));
        documents.push(Value::Document(
            doc! {"_id" => Value::Int32(1), "tag" => Value::Array(tags)},
        ));
        documents.push(Value::Document(
            doc! {"_id" => Value::Int32(2), "tag" => Value::String("a".into())},
        ));

        h.msg_insert(
            &cx,
            &msg(doc! {
                "insert" => Value::String("items".into()),
                "documents" => Value::Array(documents),
                "$db" => Value::String("test".into()),
            }),
        )
        .await
        .unwrap();

        let res = h
            .msg_distinct(
                &cx,
                &msg(doc! {
                    "distinct" => Value::String("items".into()),
                    "key" => Value::String("tag".into()),
                    "$db" => Value::String("test".into()),
                }),
            )
            .await
            .unwrap();
        let Some(Value::Array(values)) = res.document().get("values") else {
            panic!("missing values");
        };
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn delete_by_id_and_all() {
        let h = handler();
        let cx = RequestContext::detached();

        let mut documents = Array::new();
        for id in [1, 2, 3] {
            documents.push(Value::Document(doc! {"_id" => Value::Int32(id)}));
        }
        h.msg_insert(
            &cx,
            &msg(doc! {
                "insert" => Value::String("items".into()),
                "documents" => Value::Array(documents),
                "$db" => Value::String("test".into()),
            }),
        )
        .await
        .unwrap();

        let mut deletes = Array::new();
        deletes.push(Value::Document(doc! {
            "q" => Value::Document(doc! {"_id" => Value::Int32(2)}),
            "limit" => Value::Int32(1),
        }));
        let res = h
            .msg_delete(
                &cx,
                &msg(doc! {
                    "delete" => Value::String("items".into()),
                    "deletes" => Value::Array(deletes),
                    "$db" => Value::String("test".into()),
                }),
            )
            .await
            .unwrap();
        assert_eq!(res.document().get("n"), Some(&Value::Int32(1)));

        let mut deletes = Array::new();
        deletes.push(Value::Document(doc! {
            "q" => Value::Document(Document::new()),
            "limit" => Value::Int32(0),
        }));
        let res = h
            .msg_delete(
                &cx,
                &msg(doc! {
                    "delete" => Value::String("items".into()),
                    "deletes" => Value::Array(deletes),
                    "$db" => Value::String("test".into()),
                }),
            )
            .await
            .unwrap();
        assert_eq!(res.document().get("n"), Some(&Value::Int32(2)));
    }

    #[tokio::test]
    async fn list_databases_and_collections_report_inserted_namespaces() {
        let h = handler();
        let cx = RequestContext::detached();

        let mut documents = Array::new();
        documents.push(Value::Document(doc! {"_id" => Value::Int32(1)}));
        h.msg_insert(
            &cx,
            &msg(doc! {
                "insert" => Value::String("items".into()),
                "documents" => Value::Array(documents),
                "$db" => Value::String("test".into()),
            }),
        )
        .await
        .unwrap();

        let res = h
            .msg_list_databases(&cx, &msg(doc! {"listDatabases" => Value::Int32(1)}))
            .await
            .unwrap();
        let d = res.document();
        let Some(Value::Array(databases)) = d.get("databases") else {
            panic!("missing databases");
        };
        assert_eq!(databases.len(), 1);
        let Some(Value::Document(info)) = databases.get(0) else {
            panic!("databases member must be a document");
        };
        assert_eq!(info.get("name"), Some(&Value::String("test".into())));
        assert_eq!(info.get("empty"), Some(&Value::Bool(false)));
        let Some(Value::Int64(total)) = d.get("totalSize") else {
            panic!("missing totalSize");
        };
        assert!(*total > 0);

        let res = h
            .msg_list_collections(
                &cx,
                &msg(doc! {
                    "listCollections" => Value::Int32(1),
                    "$db" => Value::String("test".into()),
                }),
            )
            .await
            .unwrap();
        let Some(Value::Document(cursor)) = res.document().get("cursor") else {
            panic!("missing cursor");
        };
        assert_eq!(
            cursor.get("ns"),
            Some(&Value::String("test.$cmd.listCollections".into()))
        );
        let Some(Value::Array(batch)) = cursor.get("firstBatch") else {
            panic!("missing firstBatch");
        };
        assert_eq!(batch.len(), 1);
        let Some(Value::Document(info)) = batch.get(0) else {
            panic!("firstBatch member must be a document");
        };
        assert_eq!(info.get("name"), Some(&Value::String("items".into())));
        assert_eq!(info.get("type"), Some(&Value::String("collection".into())));
    }

    #[tokio::test]
    async fn list_collections_of_missing_database_is_empty() {
        let h = handler();
        let cx = RequestContext::detached();

        let res = h
            .msg_list_collections(
                &cx,
                &msg(doc! {
                    "listCollections" => Value::Int32(1),
                    "$db" => Value::String("nowhere".into()),
                }),
            )
            .await
            .unwrap();
        let Some(Value::Document(cursor)) = res.document().get("cursor") else {
            panic!("missing cursor");
        };
        let Some(Value::Array(batch)) = cursor.get("firstBatch") else {
            panic!("missing firstBatch");
        };
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn host_info_reports_the_system() {
        let h = handler();
        let cx = RequestContext::detached();
        let res = h
            .msg_host_info(&cx, &msg(doc! {"hostInfo" => Value::Int32(1)}))
            .await
            .unwrap();
        let d = res.document();
        assert_eq!(ok_of(&res), 1.0);
        let Some(Value::Document(system)) = d.get("system") else {
            panic!("missing system");
        };
        assert!(system.get("hostname").is_some());
        assert!(matches!(system.get("numCores"), Some(Value::Int32(n)) if *n >= 1));
    }

    #[tokio::test]
    async fn whats_my_uri_without_a_peer_is_empty() {
        let h = handler();
        let cx = RequestContext::detached();
        let res = h
            .msg_whats_my_uri(&cx, &msg(doc! {"whatsmyuri" => Value::Int32(1)}))
            .await
            .unwrap();
        assert_eq!(
            res.document().get("you"),
            Some(&Value::String(String::new()))
        );
    }

    #[tokio::test]
    async fn connection_status_reports_no_authentication() {
        let h = handler();
        let cx = RequestContext::detached();
        let res = h
            .msg_connection_status(&cx, &msg(doc! {"connectionStatus" => Value::Int32(1)}))
            .await
            .unwrap();
        let Some(Value::Document(auth)) = res.document().get("authInfo") else {
            panic!("missing authInfo");
        };
        let Some(Value::Array(users)) = auth.get("authenticatedUsers") else {
            panic!("missing authenticatedUsers");
        };
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn explain_wraps_the_inner_command() {
        let h = handler();
        let cx = RequestContext::detached();

        let res = h
            .msg_explain(
                &cx,
                &msg(doc! {
                    "explain" => Value::Document(doc! {
                        "find" => Value::String("items".into()),
                    }),
                    "$db" => Value::String("test".into()),
                }),
            )
            .await
            .unwrap();
        let d = res.document();
        assert!(d.get("queryPlanner").is_some());
        let Some(Value::Document(command)) = d.get("command") else {
            panic!("missing command");
        };
        assert_eq!(command.get("$db"), Some(&Value::String("test".into())));
    }

    #[tokio::test]
    async fn query_handshake_replies_hello() {
        let h = handler();
        let cx = RequestContext::detached();
        let reply = h
            .cmd_query(
                &cx,
                &OpQuery {
                    flags: 0,
                    full_collection_name: "admin.$cmd".into(),
                    number_to_skip: 0,
                    number_to_return: -1,
                    query: doc! {"isMaster" => Value::Int32(1)},
                    return_fields_selector: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(reply.documents.len(), 1);
        assert_eq!(
            reply.documents[0].get("helloOk"),
            Some(&Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn query_non_handshake_is_rejected() {
        let h = handler();
        let cx = RequestContext::detached();
        let err = h
            .cmd_query(
                &cx,
                &OpQuery {
                    flags: 0,
                    full_collection_name: "test.items".into(),
                    number_to_skip: 0,
                    number_to_return: 0,
                    query: doc! {"find" => Value::String("items".into())},
                    return_fields_selector: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.result_label(), "NotImplemented");
    }
}
