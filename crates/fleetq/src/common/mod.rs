pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fsutils;
pub mod poll;
pub mod setup;
