pub mod api;
pub mod atomic_writer;
pub mod batch_writer;
pub mod cache;
pub mod chain;
pub mod config;
pub mod db_handles;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod predicates;
pub mod stream;
pub mod telemetry;
pub mod types;
pub mod websocket;
