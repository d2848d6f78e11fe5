pub mod input;
pub mod lib;
