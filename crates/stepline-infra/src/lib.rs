//! Infrastructure implementations for the Stepline engine.
//!
//! - `sqlite` -- durable `StateStore` over SQLite with split read/write pools
//! - `http` -- HTTP transports for the external message channel and the
//!   verification channel
//! - `config` -- engine configuration loading from `{data_dir}/config.toml`

pub mod config;
pub mod http;
pub mod sqlite;
