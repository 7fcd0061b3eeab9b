//! Frame-level traits and the per-direction frame containers

use bytes::{Buf, BytesMut};
use enum_dispatch::enum_dispatch;

use crate::commands::{
    Body, Command, Connect, Data, EndOfHeader, EndOfMessage, Header, Helo, Macro, Mail, Recipient,
    Unknown,
};
use crate::control::{Abort, Control, Quit, QuitNc};
use crate::mods::{
    AddHeader, AddRecipient, AddRecipientPar, ChangeFrom, ChangeHeader, DeleteRecipient,
    InsertHeader, Modification, Quarantine, ReplaceBody,
};
use crate::optneg::OptNeg;
use crate::replies::{
    Accept, Continue, Discard, Progress, Reject, Reply, Replycode, Skip, TemporaryFailure,
};
use crate::{Malformed, ProtocolError, Truncated};

/// Serialize an item into its on-wire payload.
///
/// The frame header (length and code byte) is written by the codec, not by
/// the item itself.
#[enum_dispatch(MtaMessage)]
#[enum_dispatch(FilterMessage)]
#[enum_dispatch(Command)]
#[enum_dispatch(Control)]
#[enum_dispatch(Reply)]
#[enum_dispatch(Modification)]
pub trait Writable {
    /// Append the payload bytes to `buffer`
    fn write(&self, buffer: &mut BytesMut);

    /// Exact number of bytes [`Self::write`] will append
    fn len(&self) -> usize;

    /// The one-byte frame code identifying this item
    fn code(&self) -> u8;

    /// Whether [`Self::write`] would append nothing
    fn is_empty(&self) -> bool;
}

/// Deserialize an item from its on-wire payload.
pub(crate) trait Parsable: Sized {
    /// The one-byte frame code identifying this item
    const CODE: u8;

    /// Interpret `buffer` as the payload of this item.
    ///
    /// # Errors
    /// [`ProtocolError`] if the payload does not follow the item's grammar.
    fn parse(buffer: BytesMut) -> Result<Self, ProtocolError>;
}

macro_rules! frame_container {
    (
        $(#[$outer:meta])*
        $container:ident { $($variant:ident),+ $(,)? }
    ) => {
        $(#[$outer])*
        #[allow(missing_docs)]
        #[derive(Debug, Clone, strum::Display)]
        pub enum $container {
            $($variant($variant),)+
        }

        impl $container {
            /// Dispatch on the leading code byte and parse the payload.
            ///
            /// # Errors
            /// [`ProtocolError`] on an unknown code or a payload that does
            /// not parse as the item the code announces.
            pub fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
                if buffer.is_empty() {
                    return Err(Truncated::new("frame code", 1, 0).into());
                }
                let code = buffer.get_u8();
                match code {
                    $($variant::CODE => Ok($variant::parse(buffer)?.into()),)+
                    _ => Err(Malformed::new(
                        "unrecognized frame code",
                        BytesMut::from_iter(&[code]),
                    )
                    .into()),
                }
            }
        }

        $(impl From<$variant> for $container {
            fn from(value: $variant) -> Self {
                Self::$variant(value)
            }
        })+
    };
}

frame_container!(
    /// Every frame an MTA may send to a filter.
    ///
    /// This is the parse side for anything facing an MTA.
    MtaCommand {
        // Session control
        OptNeg,
        Abort,
        Quit,
        QuitNc,
        // Out-of-band info
        Macro,
        Unknown,
        // The SMTP conversation in protocol order
        Connect,
        Helo,
        Mail,
        Recipient,
        Data,
        Header,
        EndOfHeader,
        Body,
        EndOfMessage,
    }
);

frame_container!(
    /// Every frame a filter may send back to an MTA.
    ///
    /// This is the parse side for anything facing a backend filter.
    FilterReply {
        OptNeg,
        // Flow verdicts
        Continue,
        Accept,
        Reject,
        TemporaryFailure,
        Discard,
        Skip,
        Progress,
        Replycode,
        // Message modifications, valid at end-of-message only
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
);

/// Frames written when playing the MTA role toward a backend filter
#[enum_dispatch]
#[derive(Debug)]
pub enum MtaMessage {
    /// Option negotiation opener
    OptNeg(OptNeg),
    /// An SMTP-stage command
    Command,
    /// Abort or quit handling
    Control,
}

/// Frames written when playing the filter role toward an MTA
#[enum_dispatch]
#[derive(Debug)]
pub enum FilterMessage {
    /// Option negotiation answer
    OptNeg(OptNeg),
    /// A flow verdict for the current stage
    Reply,
    /// A message modification request
    Modification,
}
