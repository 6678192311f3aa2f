pub mod api;
pub mod config;
pub mod dynamips;
pub mod error;
pub mod port_manager;
pub mod project;
pub mod supervisor;
pub mod utils;
