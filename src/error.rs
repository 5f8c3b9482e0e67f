//! The error taxonomy (§7 of the design document).
//!
//! `BusError` groups into six kinds -- [`ErrorKind`] -- the same grouping the
//! design calls USAGE/CAPACITY/LOOKUP/PERMISSION/STATE/INTERRUPT. Every
//! fallible operation in this crate returns `Result<T, BusError>` (aliased as
//! [`Result`]); `anyhow` is reserved for `src/bin/kbusd.rs`.

use std::fmt;

use crate::policy::Verb;

/// Six-way grouping of [`BusError`] variants, mirroring §7.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Usage,
    Capacity,
    Lookup,
    Permission,
    State,
    Interrupt,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Usage => "USAGE",
            ErrorKind::Capacity => "CAPACITY",
            ErrorKind::Lookup => "LOOKUP",
            ErrorKind::Permission => "PERMISSION",
            ErrorKind::State => "STATE",
            ErrorKind::Interrupt => "INTERRUPT",
        };
        f.write_str(s)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    // USAGE
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("record not aligned to 8 bytes (offset {0})")]
    Misaligned(usize),
    #[error("unknown record kind: {0}")]
    UnknownRecordKind(u64),
    #[error("HELLO called twice on the same connection")]
    AlreadyGreeted,
    #[error("operation not valid in connection state {0:?}")]
    WrongState(crate::connection::ConnectionState),
    #[error("match generation {installed} already installed; {attempted} is not newer")]
    OutOfOrderGeneration { installed: u32, attempted: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid name `{0}`")]
    InvalidName(String),
    #[error("control handle already used to create {0}")]
    HandleAlreadyUsed(&'static str),
    #[error("control handle is not bound to an endpoint (currently: {0})")]
    HandleNotEndpoint(&'static str),

    // CAPACITY
    #[error("receive pool is full")]
    PoolFull,
    #[error("file descriptor table is full")]
    FdTableFull,
    #[error("mailbox overflow delivering a synthetic message")]
    MailboxOverflow,

    // LOOKUP
    #[error("no connection with id {0}")]
    NoDest(u64),
    #[error("well-known name `{0}` has no owner")]
    NameNotFound(String),

    // PERMISSION
    #[error("policy denied {verb:?} on `{object}`")]
    PolicyDenied { verb: Verb, object: String },

    // STATE
    #[error("connection is disconnected")]
    Disconnected,
    #[error("write on sealed memory object")]
    WriteOnSealed,
    #[error("unseal attempted while object has more than one reference")]
    UnsealShared,
    #[error("reply with cookie {0} has no waiting caller")]
    ReplyOrphan(u64),
    #[error("reply with cookie {0} timed out")]
    Timeout(u64),

    // INTERRUPT
    #[error("operation canceled")]
    Canceled,
    #[error("operation interrupted by a signal")]
    Interrupted,
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        use BusError::*;

        match self {
            MalformedHeader(_)
            | Misaligned(_)
            | UnknownRecordKind(_)
            | AlreadyGreeted
            | WrongState(_)
            | OutOfOrderGeneration { .. }
            | Io(_)
            | InvalidName(_)
            | HandleAlreadyUsed(_)
            | HandleNotEndpoint(_) => ErrorKind::Usage,

            PoolFull | FdTableFull | MailboxOverflow => ErrorKind::Capacity,

            NoDest(_) | NameNotFound(_) => ErrorKind::Lookup,

            PolicyDenied { .. } => ErrorKind::Permission,

            Disconnected | WriteOnSealed | UnsealShared | ReplyOrphan(_) | Timeout(_) => {
                ErrorKind::State
            }

            Canceled | Interrupted => ErrorKind::Interrupt,
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
