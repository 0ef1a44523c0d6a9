pub(crate) mod api;
pub mod auth;
pub mod chat_store;
pub mod config;
pub mod error;
pub mod observability;
pub mod reconcile;
pub mod request_log;
pub mod routing;
pub mod state;
pub mod stream;
pub mod transport;
