pub mod commands;
pub mod config;
pub mod display;
pub mod frames;
pub mod prompt_loader;
pub mod speech;
