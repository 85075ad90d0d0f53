pub mod audio;
pub mod cache;
pub mod config;
pub mod errors;
pub mod forest;
pub mod input;
pub mod integration;
pub mod mos;
pub mod orchestrator;
pub mod report;
pub mod safe_io;
pub mod video;
pub mod window;
