pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod record;
pub mod runtime;
pub mod schema;
pub mod server;
