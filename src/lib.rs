pub mod agents;
pub mod auth;
pub mod compactor;
pub mod config;
pub mod context;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod planner;
pub mod protocol;
pub mod sql;
pub mod store;
pub mod suggest;
pub mod tls;
pub mod wal;
pub mod wire;
