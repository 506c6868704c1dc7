pub mod cli;
pub mod compare;
pub mod config;
pub mod core;
pub mod engine;
pub mod exit;
pub mod harness;
pub mod logs;
pub mod platform;
pub mod provision;
pub mod rules;
pub mod scan;
pub mod ui;
pub mod workspace;
