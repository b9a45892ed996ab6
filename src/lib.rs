#![forbid(unsafe_code)]

pub mod assemble;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod convert;
pub mod cues;
pub mod error;
pub mod formats;
pub mod ids;
pub mod job;
pub mod logging;
pub mod model;
pub mod preview;
pub mod source;
pub mod stats;
pub mod store;
pub mod sync;
pub mod writer;
