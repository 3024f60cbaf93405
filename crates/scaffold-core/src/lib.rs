pub mod config;
pub mod container;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod session;
