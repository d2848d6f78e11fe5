pub mod adapters;
pub mod cli;
pub mod core;
pub mod error;
pub mod utils;
