pub mod aggregator;
pub mod api;
pub mod cache;
pub mod cleanup;
pub mod client;
pub mod config;
pub mod ingest;
pub mod locks;
pub mod maintenance;
pub mod pruner;
pub mod query;
pub mod registry;
pub mod retention;
pub mod store;
