//! Modification requests a filter may answer end-of-message with

mod content;
mod envelope;
mod headers;

use enum_dispatch::enum_dispatch;

pub use self::content::{Quarantine, ReplaceBody};
pub use self::envelope::{AddRecipient, AddRecipientPar, ChangeFrom, DeleteRecipient};
pub use self::headers::{AddHeader, ChangeHeader, InsertHeader};

use crate::optneg::Capability;

/// Every modification request combined
#[allow(missing_docs)]
#[enum_dispatch]
#[derive(Debug, Clone, strum::Display)]
pub enum Modification {
    AddHeader,
    InsertHeader,
    ChangeHeader,
    ChangeFrom,
    AddRecipient,
    AddRecipientPar,
    DeleteRecipient,
    ReplaceBody,
    Quarantine,
}

impl Modification {
    /// The action flag a filter must have negotiated to request `self`
    #[must_use]
    pub fn required_capability(&self) -> Capability {
        match self {
            Modification::AddHeader(_) => Capability::ADD_HEADERS,
            Modification::InsertHeader(_) | Modification::ChangeHeader(_) => {
                Capability::CHANGE_HEADERS
            }
            Modification::ChangeFrom(_) => Capability::CHANGE_FROM,
            Modification::AddRecipient(_) => Capability::ADD_RECIPIENT,
            Modification::AddRecipientPar(_) => Capability::ADD_RECIPIENT_PAR,
            Modification::DeleteRecipient(_) => Capability::DELETE_RECIPIENT,
            Modification::ReplaceBody(_) => Capability::CHANGE_BODY,
            Modification::Quarantine(_) => Capability::QUARANTINE,
        }
    }
}
