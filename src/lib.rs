pub mod aggregate;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod files;
pub mod prometheus;
pub mod properties;
pub mod records;
pub mod replicator;
pub mod report;
pub mod webdav;
pub mod window;

#[cfg(test)]
pub mod test_support;
