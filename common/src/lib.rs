// Common library for the storefront database layer: pool manager,
// transactional executor and schema bootstrapper

pub mod config;
pub mod db;
pub mod errors;
mod pattern;
pub mod retry;
pub mod telemetry;
