//! Wire-protocol operation codes.

use std::fmt;

/// Operation code carried in a message header.
///
/// Only `Msg` (requests) and `Query` (the legacy handshake) are routed;
/// `Reply` is the response form for `Query`. The remaining codes are
/// recognized so that their receipt can be reported and made fatal, and
/// unknown values are preserved for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// OP_REPLY = 1; response to OP_QUERY.
    Reply,
    /// OP_UPDATE = 2001; legacy.
    Update,
    /// OP_INSERT = 2002; legacy.
    Insert,
    /// OP_GET_BY_OID = 2003; legacy.
    GetByOid,
    /// OP_QUERY = 2004; legacy handshake.
    Query,
    /// OP_GET_MORE = 2005; legacy.
    GetMore,
    /// OP_DELETE = 2006; legacy.
    Delete,
    /// OP_KILL_CURSORS = 2007; legacy.
    KillCursors,
    /// OP_COMPRESSED = 2012; not decompressed, receipt is fatal.
    Compressed,
    /// OP_MSG = 2013; the general-purpose request/response frame.
    Msg,
    /// A code this implementation does not recognize.
    Unknown(i32),
}

impl OpCode {
    /// The on-wire value.
    pub fn as_i32(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::GetByOid => 2003,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Compressed => 2012,
            OpCode::Msg => 2013,
            OpCode::Unknown(code) => code,
        }
    }

    /// Whether this is a recognized code.
    pub fn is_known(self) -> bool {
        !matches!(self, OpCode::Unknown(_))
    }
}

impl From<i32> for OpCode {
    fn from(code: i32) -> Self {
        match code {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2003 => OpCode::GetByOid,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            2012 => OpCode::Compressed,
            2013 => OpCode::Msg,
            code => OpCode::Unknown(code),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::Reply => f.write_str("OP_REPLY"),
            OpCode::Update => f.write_str("OP_UPDATE"),
            OpCode::Insert => f.write_str("OP_INSERT"),
            OpCode::GetByOid => f.write_str("OP_GET_BY_OID"),
            OpCode::Query => f.write_str("OP_QUERY"),
            OpCode::GetMore => f.write_str("OP_GET_MORE"),
            OpCode::Delete => f.write_str("OP_DELETE"),
            OpCode::KillCursors => f.write_str("OP_KILL_CURSORS"),
            OpCode::Compressed => f.write_str("OP_COMPRESSED"),
            OpCode::Msg => f.write_str("OP_MSG"),
            OpCode::Unknown(code) => write!(f, "OP_UNKNOWN({code})"),
        }
    }
}
