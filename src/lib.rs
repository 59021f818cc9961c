//! Core of the FA beam position viewer: subscribes to one channel of a fast
//! acquisition server, keeps a bounded history of X/Y positions and turns the
//! latest window into raw, spectral or integrated curves.

pub mod args;
pub mod catalogue;
pub mod config;
pub mod drivers;
pub mod session;
pub mod types;
