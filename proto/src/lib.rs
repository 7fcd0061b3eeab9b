#![doc = include_str!("../Readme.md")]

pub mod buf;
pub mod commands;
pub mod control;
pub mod mods;
pub mod optneg;
pub mod replies;
pub mod wire;

mod error;

pub use error::{Malformed, ProtocolError, Truncated};
