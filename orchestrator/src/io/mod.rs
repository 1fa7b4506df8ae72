//! I/O helpers: persistence, configuration and external collaborators.

pub mod config;
pub mod files;
pub mod journal;
pub mod paths;
pub mod prompt;
pub mod reasoner;
pub mod store;
pub mod tracker;
pub mod worker;
