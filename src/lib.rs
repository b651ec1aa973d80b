pub mod bus;
pub mod config;
pub mod device;
pub mod load_manager;
pub mod numeric;
pub mod service;
pub mod supervisor;
pub mod telemetry;
