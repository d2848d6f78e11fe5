pub mod api;
pub mod input;
pub mod meru;
pub mod output;
