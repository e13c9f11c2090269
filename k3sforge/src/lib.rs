//! Command-line front end for k3sforge
//!
//! Argument groups and the HA inventory format live here so they can be
//! tested without spawning the binary.

pub mod args;
pub mod inventory;

pub use inventory::Inventory;
