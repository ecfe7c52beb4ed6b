//! Command registry: the process-wide, case-sensitive mapping from command
//! name to handler.
//!
//! The registry is built once on first use and read-only afterwards; every
//! connection task resolves against the same table.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use futures::future::BoxFuture;
use tracing::debug_span;
use tracing::Instrument;

use crate::error::CommandError;
use crate::error::ErrorCode;
use crate::error::ProtocolError;
use crate::handler::Handler;
use crate::handler::RequestContext;
use crate::wire::OpCode;
use crate::wire::OpMsg;

/// The call shape of every registered command.
pub type CommandFn = for<'a> fn(
    &'a dyn Handler,
    &'a RequestContext,
    &'a OpMsg,
) -> BoxFuture<'a, Result<OpMsg, ProtocolError>>;

/// One registry entry.
pub struct Command {
    /// One-line description served by `listCommands`.
    pub help: &'static str,
    /// The request opcode this command is valid for.
    pub op_code: OpCode,
    /// The handler trampoline.
    pub handler: CommandFn,
}

macro_rules! command {
    ($method:ident, $help:expr) => {{
        fn trampoline<'a>(
            handler: &'a dyn Handler,
            cx: &'a RequestContext,
            msg: &'a OpMsg,
        ) -> BoxFuture<'a, Result<OpMsg, ProtocolError>> {
            Box::pin(handler.$method(cx, msg))
        }

        Command {
            help: $help,
            op_code: OpCode::Msg,
            handler: trampoline,
        }
    }};
}

/// All registered commands, keyed case-sensitively by name.
pub static COMMANDS: LazyLock<BTreeMap<&'static str, Command>> = LazyLock::new(|| {
    BTreeMap::from([
        ("buildInfo", command!(msg_build_info, "Returns a summary of the build.")),
        ("buildinfo", command!(msg_build_info, "Returns a summary of the build.")),
        ("connectionStatus", command!(msg_connection_status, "Returns the state of the current connection.")),
        ("delete", command!(msg_delete, "Deletes documents matched by _id.")),
        ("distinct", command!(msg_distinct, "Returns an array of distinct values for the given field.")),
        ("explain", command!(msg_explain, "Returns the execution plan.")),
        ("find", command!(msg_find, "Returns documents of the collection.")),
        ("getLog", command!(msg_get_log, "Returns the most recent logged events from memory.")),
        ("hello", command!(msg_hello, "Returns the role of this instance.")),
        ("hostInfo", command!(msg_host_info, "Returns a summary of the system the server runs on.")),
        ("insert", command!(msg_insert, "Inserts documents into the collection.")),
        ("isMaster", command!(msg_hello, "Returns the role of this instance (legacy spelling).")),
        ("ismaster", command!(msg_hello, "Returns the role of this instance (legacy spelling).")),
        ("listCollections", command!(msg_list_collections, "Returns the information of the collections in the database.")),
        ("listCommands", command!(msg_list_commands, "Returns the list of supported commands.")),
        ("listDatabases", command!(msg_list_databases, "Returns a summary of all the databases.")),
        ("ping", command!(msg_ping, "Returns a pong response.")),
        ("whatsmyuri", command!(msg_whats_my_uri, "Returns the peer address of this connection.")),
    ])
});

/// Route `msg` to its command handler.
///
/// A name missing from the registry produces `CommandNotFound`; a name
/// registered for a different opcode produces a not-implemented error.
pub async fn dispatch(
    handler: &dyn Handler,
    cx: &RequestContext,
    msg: &OpMsg,
) -> Result<OpMsg, ProtocolError> {
    let command = msg.document().command();

    let Some(cmd) = COMMANDS.get(command) else {
        return Err(ProtocolError::command_not_found(command));
    };
    if cmd.op_code != OpCode::Msg {
        return Err(CommandError::new(
            ErrorCode::NotImplemented,
            format!("command '{command}' is not supported for OP_MSG"),
        )
        .with_argument(command.to_owned())
        .into());
    }

    (cmd.handler)(handler, cx, msg)
        .instrument(debug_span!("command.dispatch", command = %command))
        .await
}
