pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod exit;
pub mod fixes;
pub mod logs;
pub mod platform;
pub mod plugins;
pub mod rules;
pub mod ui;
