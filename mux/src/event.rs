//! The signals a [`Children`](crate::Children) emits toward its MTA-side
//! consumer

use std::io;

use async_trait::async_trait;

use muxtr_proto::mods::{
    AddHeader, AddRecipient, AddRecipientPar, ChangeFrom, ChangeHeader, DeleteRecipient,
    InsertHeader, Quarantine,
};
use muxtr_proto::optneg::OptNeg;
use muxtr_proto::replies::Replycode;

use crate::verdict::Verdict;

/// Everything the multiplexer tells the MTA side.
///
/// At most one flow event is emitted per stage; modification events arrive
/// during end-of-message handling, the rest report lifecycle changes.
#[derive(Debug)]
pub enum Event {
    /// Negotiation finished; the merged option set, macro requests included
    NegotiateReply(OptNeg),
    /// The stage passed; proceed
    Continue,
    /// The aggregated verdict is reject
    Reject,
    /// The aggregated verdict is a temporary failure
    TemporaryFailure,
    /// The aggregated verdict is accept
    Accept,
    /// The aggregated verdict is discard
    Discard,
    /// The aggregated verdict is skip
    Skip,
    /// A backend asks for patience during end-of-message
    Progress,
    /// A backend wants the message quarantined
    Quarantine(Quarantine),
    /// A backend dictated an explicit SMTP reply
    ReplyCode(Replycode),
    /// Append a header
    AddHeader(AddHeader),
    /// Insert a header at a position
    InsertHeader(InsertHeader),
    /// Change or delete a header occurrence
    ChangeHeader(ChangeHeader),
    /// Replace the envelope sender
    ChangeFrom(ChangeFrom),
    /// Add an envelope recipient
    AddRecipient(AddRecipient),
    /// Add an envelope recipient with ESMTP arguments
    AddRecipientPar(AddRecipientPar),
    /// Remove an envelope recipient
    DeleteRecipient(DeleteRecipient),
    /// One chunk of the replacement body
    ReplaceBody(bytes::Bytes),
    /// A backend asked for the MTA connection to be shut down
    Shutdown,
    /// No backend could be reached at negotiation time
    ConnectionFailure,
    /// All backend sessions are gone; the message is over for us
    Finished,
    /// A backend failed; its vote is lost, the message goes on
    Error {
        /// The backend concerned, if attributable
        backend: Option<String>,
        /// What went wrong
        message: String,
    },
}

impl Event {
    /// Whether this event answers the current stage (at most one of these
    /// is emitted per stage)
    #[must_use]
    pub fn is_flow(&self) -> bool {
        matches!(
            self,
            Event::NegotiateReply(_)
                | Event::Continue
                | Event::Reject
                | Event::TemporaryFailure
                | Event::Accept
                | Event::Discard
                | Event::Skip
                | Event::ReplyCode(_)
        )
    }

    /// The flow event announcing `verdict`; `NotChange` maps to continue
    #[must_use]
    pub fn from_verdict(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Reject => Event::Reject,
            Verdict::Discard => Event::Discard,
            Verdict::Accept => Event::Accept,
            Verdict::TemporaryFailure => Event::TemporaryFailure,
            Verdict::Skip => Event::Skip,
            Verdict::Continue | Verdict::NotChange => Event::Continue,
        }
    }
}

/// Consumes the event stream of one [`Children`](crate::Children).
///
/// The gateway implementation writes milter reply frames to the MTA; tests
/// collect events into a vector.
#[async_trait]
pub trait EventSink: Send {
    /// Take delivery of one event
    ///
    /// # Errors
    /// An io error here aborts the facade operation that produced the
    /// event.
    async fn emit(&mut self, event: Event) -> io::Result<()>;
}

/// An [`EventSink`] that simply remembers everything, newest last
#[derive(Debug, Default)]
pub struct CollectSink {
    /// The events received so far
    pub events: Vec<Event>,
}

impl CollectSink {
    /// An empty collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventSink for CollectSink {
    async fn emit(&mut self, event: Event) -> io::Result<()> {
        self.events.push(event);
        Ok(())
    }
}
