//! # Commands Module
//!
//! The two command handlers for cipherchat:
//!
//! ## `serve`
//! Runs the relay server:
//! - Generates the relay's key pair once at startup
//! - Accepts client connections and opens the key exchange
//! - Re-encrypts every message individually per recipient
//! - Stores uploaded files for on-demand download
//!
//! ## `connect`
//! Runs the interactive console client:
//! - Connects to a relay and completes the key exchange
//! - Sends text with `/send` (or any bare input)
//! - Sends files and photos with `/file` and `/photo`
//! - Downloads announced files with `/download`

pub mod connect;
pub mod serve;
