//! Command implementations for the firmflow CLI

pub mod config;
pub mod plugins;
pub mod unpack;
