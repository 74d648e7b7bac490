pub mod augment;
pub mod config;
pub mod data;
pub mod error;
pub mod fetch;
pub mod infer;
pub mod model;
pub mod report;
pub mod server;
pub mod train;
