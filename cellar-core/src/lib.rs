pub mod config;
pub mod context;
pub mod engine;
pub mod models;
pub mod producer;
pub mod store;
