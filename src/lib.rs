//! mongo-migrator library exports

pub mod config;
pub mod db;
pub mod error;
pub mod migrations;
pub mod store;
