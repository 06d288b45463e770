pub mod config;
pub mod derivatives;
pub mod error;
pub mod hook;
pub mod loss;
pub mod module;
pub mod results;
