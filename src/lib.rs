//! fuzz-collector: a result-collection endpoint for fuzzing harnesses
//!
//! Remote test runners connect, send one 13-byte status packet and
//! disconnect. Each packet is decoded and recorded as a success, crash
//! or warning line in a timestamped result log.
//!
//! Modules, leaf first:
//! - `packet`: wire format decode/encode
//! - `log_sink`: serialized multi-destination result log
//! - `handler`: per-connection read, decode, report, close
//! - `server`: listener and bounded dispatch
//! - `config`: CLI and TOML configuration

pub mod config;
pub mod handler;
pub mod log_sink;
pub mod packet;
pub mod server;
