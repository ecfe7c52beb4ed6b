//! The handler seam: the collaborator that implements command semantics.
//!
//! The core routes requests to a [`Handler`] and shuttles opaque documents;
//! what a command *means* is entirely the handler's business.
//! [`BackendHandler`] is the bundled implementation over the storage
//! contract.

mod backend;

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProtocolError;
use crate::wire::OpMsg;
use crate::wire::OpQuery;
use crate::wire::OpReply;

pub use backend::BackendHandler;

/// Per-request context handed to every handler call.
///
/// The token is canceled when the client disconnects or the server shuts
/// down; handlers are expected to honor it and pass it on to the backend.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Cancellation signal for this connection.
    pub token: CancellationToken,
    /// The peer address, when the transport has one.
    pub peer_addr: Option<SocketAddr>,
}

impl RequestContext {
    /// A context for tests and tools: fresh token, no peer.
    pub fn detached() -> Self {
        Self {
            token: CancellationToken::new(),
            peer_addr: None,
        }
    }
}

/// Command semantics provider.
///
/// Implementations must not panic on bad input; they may panic on internal
/// invariants. Errors are returned as [`ProtocolError`] and rendered on the
/// wire by the connection runner.
#[async_trait]
pub trait Handler: Send + Sync {
    /// `ping`: liveness check.
    async fn msg_ping(&self, cx: &RequestContext, msg: &OpMsg) -> Result<OpMsg, ProtocolError>;

    /// `hello` / `isMaster`: topology handshake.
    async fn msg_hello(&self, cx: &RequestContext, msg: &OpMsg) -> Result<OpMsg, ProtocolError>;

    /// `buildInfo`: build summary.
    async fn msg_build_info(
        &self,
        cx: &RequestContext,
        msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError>;

    /// `listCommands`: the registry, name and help per command.
    async fn msg_list_commands(
        &self,
        cx: &RequestContext,
        msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError>;

    /// `getLog`: startup warnings and friends.
    async fn msg_get_log(&self, cx: &RequestContext, msg: &OpMsg)
        -> Result<OpMsg, ProtocolError>;

    /// `listDatabases`: all existing databases with size accounting.
    async fn msg_list_databases(
        &self,
        cx: &RequestContext,
        msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError>;

    /// `listCollections`: the collections of one database.
    async fn msg_list_collections(
        &self,
        cx: &RequestContext,
        msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError>;

    /// `hostInfo`: the system the server runs on.
    async fn msg_host_info(
        &self,
        cx: &RequestContext,
        msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError>;

    /// `whatsmyuri`: the peer address of this connection.
    async fn msg_whats_my_uri(
        &self,
        cx: &RequestContext,
        msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError>;

    /// `connectionStatus`: authentication state of this connection.
    async fn msg_connection_status(
        &self,
        cx: &RequestContext,
        msg: &OpMsg,
    ) -> Result<OpMsg, ProtocolError>;

    /// `insert`: batched document insert.
    async fn msg_insert(&self, cx: &RequestContext, msg: &OpMsg) -> Result<OpMsg, ProtocolError>;

    /// `find`: full-collection read.
    async fn msg_find(&self, cx: &RequestContext, msg: &OpMsg) -> Result<OpMsg, ProtocolError>;

    /// `distinct`: distinct values of one field.
    async fn msg_distinct(&self, cx: &RequestContext, msg: &OpMsg)
        -> Result<OpMsg, ProtocolError>;

    /// `explain`: backend execution plan.
    async fn msg_explain(&self, cx: &RequestContext, msg: &OpMsg)
        -> Result<OpMsg, ProtocolError>;

    /// `delete`: batched delete by `_id`.
    async fn msg_delete(&self, cx: &RequestContext, msg: &OpMsg) -> Result<OpMsg, ProtocolError>;

    /// The OP_QUERY handshake; answers with OP_REPLY.
    async fn cmd_query(
        &self,
        cx: &RequestContext,
        query: &OpQuery,
    ) -> Result<OpReply, ProtocolError>;
}
