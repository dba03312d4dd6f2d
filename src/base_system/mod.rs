pub mod config;
pub mod context;
pub mod interrupt;
pub mod logging;
pub mod paths;
