pub mod authenticate;
pub mod cli;
pub mod config;
pub mod listener;
pub mod logging;
pub mod upload;
