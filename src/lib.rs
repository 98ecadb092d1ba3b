pub mod auth;
pub mod catalog;
pub mod compactor;
pub mod config;
pub mod email;
pub mod engine;
pub mod hours;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod store;
pub mod tls;
pub mod wal;
pub mod wire;
