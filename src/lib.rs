#![forbid(unsafe_code)]

pub mod audio;
pub mod cli;
pub mod config;
pub mod download;
pub mod extract;
pub mod fetch;
pub mod formats;
pub mod harvest;
pub mod ledger;
pub mod logging;
pub mod metadata;
pub mod pool;
