//! Per-client-group sync machinery inside a syncer worker: the
//! authenticated session, the mutation pusher, and the per-socket
//! connection state machine.

pub mod auth;
pub mod connection;
pub mod fetch;
pub mod inspector;
pub mod pusher;
pub mod transformer;

mod metrics;

#[cfg(test)]
mod tests;

pub use auth::{
    Auth,
    AuthSession,
    TokenValidator,
    UnverifiedJwtValidator,
};
pub use connection::{
    Connection,
    ConnectionState,
    ViewSyncer,
};
pub use fetch::{
    FetchClient,
    HttpRequest,
    HttpResponse,
    ReqwestFetchClient,
};
pub use inspector::InspectorRegistry;
pub use pusher::{
    PusherConfig,
    PusherEvent,
    PusherService,
};
pub use transformer::{
    QueryTransformer,
    TransformerConfig,
};
