pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod legacy;
pub mod models;
pub mod reactive;
pub mod server;
pub mod services;
pub mod store;
pub mod sync;
