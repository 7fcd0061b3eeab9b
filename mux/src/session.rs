//! One backend filter session: its transport, protocol stage and deadlines

use std::time::Duration;

use asynchronous_codec::Framed;
use futures::{SinkExt, StreamExt};
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use muxtr_proto::commands::Command;
use muxtr_proto::control::{Abort, Control, Quit};
use muxtr_proto::optneg::{OptNeg, Protocol};
use muxtr_proto::wire::{FilterReply, MtaMessage};
use muxtr_proto::ProtocolError;

use crate::backend::{BoxedIo, Timeouts};
use crate::codec::{FilterCodec, MAX_FRAME_SIZE};

/// Identifies one session within its [`Children`](crate::Children) for the
/// lifetime of that instance
pub type SessionId = usize;

/// The milter conversation stages, used both as per-session protocol state
/// and as the key for per-stage reply aggregation
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Stage {
    Start = 0,
    Negotiate,
    Connect,
    Helo,
    MailFrom,
    RcptTo,
    Data,
    Unknown,
    Header,
    EndOfHeader,
    Body,
    EndOfMessage,
    Quit,
    Abort,
}

impl Stage {
    /// How many stages exist; sizes the per-stage aggregation array
    pub const COUNT: usize = 14;

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// The step flag excluding a backend from this stage, if one exists
    pub(crate) fn no_step(self) -> Option<Protocol> {
        match self {
            Stage::Connect => Some(Protocol::NO_CONNECT),
            Stage::Helo => Some(Protocol::NO_HELO),
            Stage::MailFrom => Some(Protocol::NO_MAIL),
            Stage::RcptTo => Some(Protocol::NO_RECIPIENT),
            Stage::Data => Some(Protocol::NO_DATA),
            Stage::Unknown => Some(Protocol::NO_UNKNOWN),
            Stage::Header => Some(Protocol::NO_HEADER),
            Stage::EndOfHeader => Some(Protocol::NO_END_OF_HEADER),
            Stage::Body => Some(Protocol::NO_BODY),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Start => "start",
            Stage::Negotiate => "negotiate",
            Stage::Connect => "connect",
            Stage::Helo => "helo",
            Stage::MailFrom => "mail-from",
            Stage::RcptTo => "rcpt-to",
            Stage::Data => "data",
            Stage::Unknown => "unknown",
            Stage::Header => "header",
            Stage::EndOfHeader => "end-of-header",
            Stage::Body => "body",
            Stage::EndOfMessage => "end-of-message",
            Stage::Quit => "quit",
            Stage::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// What waiting on a session produced
#[derive(Debug)]
pub(crate) enum SessionOutcome {
    /// The filter answered
    Reply(FilterReply),
    /// The armed deadline fired first
    TimedOut,
    /// The filter closed its end of the transport
    Closed,
    /// The transport or the codec failed
    Failed(ProtocolError),
}

/// The per-message session bound to one backend filter.
///
/// Commands sent through it advance [`BackendSession::stage`] and arm the
/// read deadline; [`BackendSession::wait`] resolves to whatever comes back
/// first, reply or deadline.
pub(crate) struct BackendSession {
    pub id: SessionId,
    pub name: String,
    pub stage: Stage,
    /// Set once this filter answered SKIP to a body chunk
    pub skip_body: bool,
    /// The option set this filter announced during negotiation
    pub options: OptNeg,
    framed: Framed<BoxedIo, FilterCodec>,
    timeouts: Timeouts,
    pending: u32,
    deadline: Option<Instant>,
}

impl BackendSession {
    pub fn new(id: SessionId, name: String, io: BoxedIo, timeouts: Timeouts) -> Self {
        Self {
            id,
            name,
            stage: Stage::Start,
            skip_body: false,
            options: OptNeg {
                protocol: Protocol::empty(),
                ..OptNeg::default()
            },
            framed: Framed::new(io, FilterCodec::new(MAX_FRAME_SIZE)),
            timeouts,
            pending: 0,
            deadline: None,
        }
    }

    /// Whether a reply from this session is still outstanding
    pub fn is_awaiting(&self) -> bool {
        self.pending > 0
    }

    /// Whether this session's step flags exclude it from `stage`
    pub fn excluded_from(&self, stage: Stage) -> bool {
        stage
            .no_step()
            .is_some_and(|flag| self.options.protocol.contains(flag))
    }

    /// Expect one more reply, arming the deadline fitting `stage`
    pub fn expect_reply(&mut self, stage: Stage) {
        let patience = if stage == Stage::EndOfMessage {
            self.timeouts.end_of_message
        } else {
            self.timeouts.read
        };

        self.pending += 1;
        self.deadline = Some(Instant::now() + patience);
    }

    async fn send(&mut self, message: &MtaMessage) -> Result<(), ProtocolError> {
        let sent = tokio::time::timeout(self.timeouts.write, self.framed.send(message)).await;
        match sent {
            Ok(result) => result,
            Err(_elapsed) => Err(ProtocolError::Io(write_timeout(self.timeouts.write))),
        }
    }

    /// Send `command` for `stage`.
    ///
    /// Honors the filter's negotiated step flags: a suppressed command is
    /// not sent at all, a no-reply command is sent without arming a
    /// deadline. Returns whether a reply is now expected.
    pub async fn dispatch(&mut self, stage: Stage, command: Command) -> Result<bool, ProtocolError> {
        if self.options.protocol.suppresses_send(&command) {
            trace!(backend = %self.name, %command, "step flags suppress sending");
            return Ok(false);
        }
        let expects_reply = !self.options.protocol.suppresses_reply(&command);

        self.stage = stage;
        self.send(&MtaMessage::Command(command)).await?;

        if expects_reply {
            self.expect_reply(stage);
        }
        Ok(expects_reply)
    }

    /// Open negotiation by offering `option`
    pub async fn negotiate(&mut self, option: &OptNeg) -> Result<(), ProtocolError> {
        self.stage = Stage::Negotiate;
        self.send(&MtaMessage::OptNeg(option.clone())).await?;
        self.expect_reply(Stage::Negotiate);
        Ok(())
    }

    /// Relay a macro set; macros ride along without changing stage state
    pub async fn forward_macro(
        &mut self,
        macro_: muxtr_proto::commands::Macro,
    ) -> Result<(), ProtocolError> {
        self.send(&MtaMessage::Command(Command::Macro(macro_))).await
    }

    /// Ask the filter to drop the current message
    pub async fn abort(&mut self) -> Result<(), ProtocolError> {
        self.stage = Stage::Abort;
        self.send(&MtaMessage::Control(Control::Abort(Abort))).await
    }

    /// Close the conversation for good
    pub async fn quit(&mut self) -> Result<(), ProtocolError> {
        self.stage = Stage::Quit;
        self.pending = 0;
        self.deadline = None;
        self.send(&MtaMessage::Control(Control::Quit(Quit))).await
    }

    /// Resolve once the filter answers, fails, or the deadline fires.
    ///
    /// Must only be polled while [`Self::is_awaiting`]; an available reply
    /// wins over an already-expired deadline.
    pub async fn wait(&mut self) -> (SessionId, SessionOutcome) {
        let deadline = self
            .deadline
            .unwrap_or_else(|| Instant::now() + self.timeouts.read);

        let outcome = tokio::select! {
            biased;
            frame = self.framed.next() => match frame {
                Some(Ok(reply)) => {
                    self.pending = self.pending.saturating_sub(1);
                    if self.pending == 0 {
                        self.deadline = None;
                    }
                    SessionOutcome::Reply(reply)
                }
                Some(Err(error)) => SessionOutcome::Failed(error),
                None => SessionOutcome::Closed,
            },
            () = sleep_until(deadline) => SessionOutcome::TimedOut,
        };

        (self.id, outcome)
    }
}

fn write_timeout(after: Duration) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("write stalled for {after:?}"),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stage_step_flags() {
        assert_eq!(Stage::Helo.no_step(), Some(Protocol::NO_HELO));
        assert_eq!(Stage::Body.no_step(), Some(Protocol::NO_BODY));
        assert_eq!(Stage::EndOfMessage.no_step(), None);
        assert_eq!(Stage::Negotiate.no_step(), None);
    }

    #[test]
    fn stage_indices_are_dense() {
        let stages = [
            Stage::Start,
            Stage::Negotiate,
            Stage::Connect,
            Stage::Helo,
            Stage::MailFrom,
            Stage::RcptTo,
            Stage::Data,
            Stage::Unknown,
            Stage::Header,
            Stage::EndOfHeader,
            Stage::Body,
            Stage::EndOfMessage,
            Stage::Quit,
            Stage::Abort,
        ];

        assert_eq!(stages.len(), Stage::COUNT);
        for (expected, stage) in stages.into_iter().enumerate() {
            assert_eq!(stage.index(), expected);
        }
    }
}
