#![deny(clippy::await_holding_refcell_ref)]

pub mod client;
pub mod cloud;
pub mod cluster;
pub mod common;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::FleetError;
pub type Result<T> = std::result::Result<T, Error>;

pub const FLEETQ_VERSION: &str = env!("CARGO_PKG_VERSION");
