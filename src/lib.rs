pub mod call;
pub mod config;
pub mod event;
