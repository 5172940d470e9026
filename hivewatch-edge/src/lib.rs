pub mod buffer;
pub mod collector;
pub mod config;
pub mod forwarder;
pub mod reader;
pub mod scheduler;
pub mod transport;
