#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod action;
pub mod check;
pub mod cli;
pub mod command_runner;
pub mod config;
pub mod disk_image;
pub mod download;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod install;
pub mod logging;
pub mod multi_update;
pub mod oob;
pub mod params;
pub mod paths;
pub mod progress;
pub mod server;
pub mod stats;
pub mod ticket;
pub mod ticket_store;
pub mod update;
pub mod update_info;

pub use engine::{Engine, EngineContext, EngineDelegate, EngineSettings};
pub use error::EngineError;
