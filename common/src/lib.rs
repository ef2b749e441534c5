// Common library shared by the API server and the integration tests

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod retry;
pub mod scan;
pub mod telemetry;
