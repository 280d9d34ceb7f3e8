#![cfg_attr(not(test), no_std)]

//! nRF52820 Key/Value Command Firmware Library
//!
//! A flash-backed key/value store driven by short ASCII commands that arrive
//! over UART or BLE:
//!
//! - `core`: flash file, key/value store, BLE framing, serial transport
//! - `ble`: connection registry, notifications, event handling
//! - `commands`: command parsing and dispatch

// Must come first so the logging macros are visible to every module
pub(crate) mod fmt;

pub mod ble;
pub mod commands;
pub mod config;
pub mod core;
