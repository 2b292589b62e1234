//! BLE switch bridge library
//! Keeps a BLE peripheral's boolean characteristic connected and exposes it as
//! a switch accessory with push or poll state updates.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
