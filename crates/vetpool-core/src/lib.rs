pub mod commands;
pub mod config;
pub mod execution;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod registry;
pub mod routine;
pub mod session;
pub mod sink;
pub mod sqlite;
pub mod task_context;
