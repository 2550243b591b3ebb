//! Buffers log lines from a local source and ships them, grouped by tag, to a
//! Sumo Logic HTTP collector.

pub mod buffer;
pub mod config;
pub mod flush;
pub mod sources;
pub mod uploader;

#[cfg(test)]
mod testing;
