//! Wire types for the sync protocol: the client↔server WebSocket messages,
//! connect parameters, and the HTTP bodies exchanged with the user's API
//! server (push and query-transform endpoints).
//!
//! WebSocket messages are encoded as JSON tuples `[kind, body]`, e.g.
//! `["connected",{"wsid":"..","timestamp":123}]`, matching the client
//! library's framing.

mod connect;
mod messages;
mod push;
mod transform;

pub use connect::{
    decode_init_connection_header,
    ConnectParams,
    InitConnectionHeader,
};
pub use messages::{
    ChangeDesiredQueriesBody,
    ConnectedBody,
    DeleteClientsBody,
    DownstreamMessage,
    InitConnectionBody,
    InspectBody,
    PokeEndBody,
    PokePartBody,
    PokeStartBody,
    UpstreamMessage,
};
pub use push::{
    Mutation,
    MutationId,
    MutationResponse,
    MutationResult,
    PushBody,
    PushError,
    PushErrorKind,
    PushOk,
    PushResult,
    PUSH_VERSION,
};
pub use transform::{
    TransformRequest,
    TransformRequestEntry,
    TransformResponse,
    TransformedEntry,
};

pub type ClientId = String;
pub type ClientGroupId = String;

/// Newest protocol version this server speaks.
pub const PROTOCOL_VERSION: u32 = 21;

/// Oldest client protocol version this server still accepts. Clients below
/// this receive `VersionNotSupported` at init.
pub const MIN_SERVER_SUPPORTED_PROTOCOL_VERSION: u32 = 17;
