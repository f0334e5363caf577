pub mod config;
pub mod context;
pub mod job;
pub mod logging;
pub mod shutdown;
pub mod tail;
pub mod web;
