pub mod api;
pub mod bus;
pub mod cluster;
pub mod config;
pub mod error;
pub mod master;
pub mod protocol;
pub mod runtime;
pub mod shutdown;
