pub mod config;
pub mod diagnostics;
pub mod pipeline;
pub mod token;
