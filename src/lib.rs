pub mod app;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod domain;
pub mod error;
pub mod filter;
pub mod fs_util;
pub mod install;
pub mod listing;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod remote;
pub mod retrieval;
pub mod scheduler;
pub mod task;
