pub mod cli;
pub mod config;
pub mod health;
pub mod log;
pub mod paths;
pub mod port;
pub mod process;
pub mod registry;
pub mod stats;
pub mod supervisor;
pub mod sys;
