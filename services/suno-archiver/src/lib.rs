//!
//! src/lib.rs  Andrew Belles  Oct 18th, 2025
//!
//! Library root of the song library archiver. The binary in main.rs wires
//! these stages into the scrape, download and analyze commands.
//!

pub mod config;
pub mod errors;
pub mod logging;

pub mod browser;
pub mod crawler;
pub mod extract;
pub mod collector;
pub mod fetch;
pub mod sink;

pub mod export;
pub mod download;
pub mod duplicates;
pub mod tagging;
pub mod persistent;
pub mod analyzer;

pub mod types;
pub mod util;

pub use crate::errors::ArchiverError;
