//! The SMTP conversation as the MTA reports it, stage by stage

mod content;
mod envelope;
mod macros;

use enum_dispatch::enum_dispatch;

pub use self::content::{Body, Data, EndOfHeader, EndOfMessage, Header, Unknown};
pub use self::envelope::{Connect, Family, Helo, Mail, Recipient};
pub use self::macros::Macro;

/// Every stage command, in the order the protocol produces them
#[allow(missing_docs)]
#[enum_dispatch]
#[derive(Debug, Clone, strum::Display)]
pub enum Command {
    Connect,
    Helo,
    Mail,
    Recipient,
    Data,
    Header,
    EndOfHeader,
    Body,
    EndOfMessage,
    Unknown,
    Macro,
}
