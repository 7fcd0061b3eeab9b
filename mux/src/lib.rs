#![doc = include_str!("../Readme.md")]

pub mod backend;
pub mod event;
pub mod headers;
pub mod spool;
pub mod verdict;

mod children;
mod codec;
mod error;
mod sequence;
mod session;

pub use children::{Children, ChildrenConfig};
pub use error::MuxError;
pub use event::{CollectSink, Event, EventSink};
pub use session::{SessionId, Stage};
