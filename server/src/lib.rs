#![doc = include_str!("../Readme.md")]

mod codec;

use async_trait::async_trait;
use asynchronous_codec::Framed;
use futures::{AsyncRead, AsyncWrite, SinkExt, StreamExt};
use std::io;
use thiserror::Error;
use tracing::{debug, warn};

use muxtr::{Children, Event, EventSink, MuxError};
use muxtr_proto::mods::{Modification, ReplaceBody};
use muxtr_proto::optneg::Protocol;
use muxtr_proto::replies::{
    Accept, Continue, Discard, Progress, Reject, Reply, Skip, TemporaryFailure,
};
use muxtr_proto::wire::{FilterMessage, MtaCommand};
use muxtr_proto::ProtocolError;

use crate::codec::{MilterCodec, MAX_FRAME_SIZE};

/// Everything that can end an MTA conversation abnormally
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The MTA sent bytes the codec could not make sense of
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The multiplexer core gave up on the message
    #[error(transparent)]
    Mux(#[from] MuxError),
}

/// One MTA connection glued to one [`Children`] instance.
///
/// The gateway decodes each milter command from the MTA, drives the
/// matching multiplexer operation, and writes whatever events that
/// operation emits back to the MTA as milter frames. A command that
/// expects a reply but produced no flow event is acknowledged with
/// `CONTINUE`, unless the merged option's no-reply flags say otherwise.
pub struct Gateway {
    children: Children,
}

impl Gateway {
    /// Serve `children` to one MTA
    #[must_use]
    pub fn new(children: Children) -> Self {
        Self { children }
    }

    /// The multiplexer behind this gateway
    #[must_use]
    pub fn children(&self) -> &Children {
        &self.children
    }

    /// Handle the whole milter conversation on `socket`.
    ///
    /// Returns when the MTA quits, closes the connection, or a backend
    /// asked for a shutdown.
    ///
    /// # Errors
    /// On undecodable MTA frames and on fatal multiplexer errors; backend
    /// trouble alone never ends the conversation.
    pub async fn handle<RW>(&mut self, socket: RW) -> Result<(), GatewayError>
    where
        RW: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut framed = Framed::new(socket, MilterCodec::new(MAX_FRAME_SIZE));

        while let Some(command) = framed.next().await {
            let command = command?;
            debug!(%command, "mta command");

            let expects_reply = command_expects_reply(&command);
            let suppressed = self.reply_suppressed(&command);

            let mut sink = WireSink {
                framed: &mut framed,
                answered: false,
                shutdown: false,
            };

            match command {
                MtaCommand::OptNeg(offer) => self.children.negotiate(offer, &mut sink).await?,
                MtaCommand::Connect(connect) => self.children.connect(connect, &mut sink).await?,
                MtaCommand::Helo(helo) => self.children.helo(helo, &mut sink).await?,
                MtaCommand::Mail(mail) => self.children.envelope_from(mail, &mut sink).await?,
                MtaCommand::Recipient(recipient) => {
                    self.children.envelope_recipient(recipient, &mut sink).await?;
                }
                MtaCommand::Data(_) => self.children.data(&mut sink).await?,
                MtaCommand::Header(header) => self.children.header(header, &mut sink).await?,
                MtaCommand::EndOfHeader(_) => self.children.end_of_header(&mut sink).await?,
                MtaCommand::Body(body) => self.children.body(body, &mut sink).await?,
                MtaCommand::EndOfMessage(end) => {
                    self.children.end_of_message(end, &mut sink).await?;
                }
                MtaCommand::Unknown(unknown) => self.children.unknown(unknown, &mut sink).await?,
                MtaCommand::Macro(macro_) => {
                    self.children.macro_forward(macro_, &mut sink).await?;
                }
                MtaCommand::Abort(_) => self.children.abort(&mut sink).await?,
                MtaCommand::Quit(_) | MtaCommand::QuitNc(_) => {
                    // Postfix treats both as tearing the connection down
                    self.children.quit(&mut sink).await?;
                    return Ok(());
                }
            }

            let answered = sink.answered;
            let shutdown = sink.shutdown;
            drop(sink);

            if expects_reply && !answered && !suppressed {
                // Nobody objected; that is a continue
                framed
                    .send(&FilterMessage::Reply(Reply::Continue(Continue)))
                    .await?;
            }
            if shutdown {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Whether the merged option's no-reply flags free us from answering
    /// `command`
    fn reply_suppressed(&self, command: &MtaCommand) -> bool {
        let Some(option) = self.children.merged_option() else {
            return false;
        };
        let protocol = option.protocol;
        match command {
            MtaCommand::Connect(_) => protocol.contains(Protocol::NR_CONNECT),
            MtaCommand::Helo(_) => protocol.contains(Protocol::NR_HELO),
            MtaCommand::Mail(_) => protocol.contains(Protocol::NR_MAIL),
            MtaCommand::Recipient(_) => protocol.contains(Protocol::NR_RECIPIENT),
            MtaCommand::Data(_) => protocol.contains(Protocol::NR_DATA),
            MtaCommand::Header(_) => protocol.contains(Protocol::NR_HEADER),
            MtaCommand::EndOfHeader(_) => protocol.contains(Protocol::NR_END_OF_HEADER),
            MtaCommand::Body(_) => protocol.contains(Protocol::NR_BODY),
            MtaCommand::Unknown(_) => protocol.contains(Protocol::NR_UNKNOWN),
            _ => false,
        }
    }
}

fn command_expects_reply(command: &MtaCommand) -> bool {
    !matches!(
        command,
        MtaCommand::Macro(_)
            | MtaCommand::Abort(_)
            | MtaCommand::Quit(_)
            | MtaCommand::QuitNc(_)
    )
}

/// Translates multiplexer events into milter frames on the MTA connection
struct WireSink<'a, RW: AsyncRead + AsyncWrite + Send + Unpin> {
    framed: &'a mut Framed<RW, MilterCodec>,
    answered: bool,
    shutdown: bool,
}

impl<RW: AsyncRead + AsyncWrite + Send + Unpin> WireSink<'_, RW> {
    async fn send(&mut self, message: FilterMessage) -> io::Result<()> {
        self.framed
            .send(&message)
            .await
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error.to_string()))
    }
}

#[async_trait]
impl<RW: AsyncRead + AsyncWrite + Send + Unpin> EventSink for WireSink<'_, RW> {
    async fn emit(&mut self, event: Event) -> io::Result<()> {
        if event.is_flow() {
            self.answered = true;
        }

        match event {
            Event::NegotiateReply(option) => self.send(FilterMessage::OptNeg(option)).await,
            Event::Continue => {
                self.send(FilterMessage::Reply(Reply::Continue(Continue)))
                    .await
            }
            Event::Reject => self.send(FilterMessage::Reply(Reply::Reject(Reject))).await,
            Event::TemporaryFailure => {
                self.send(FilterMessage::Reply(Reply::TemporaryFailure(
                    TemporaryFailure,
                )))
                .await
            }
            Event::Accept => self.send(FilterMessage::Reply(Reply::Accept(Accept))).await,
            Event::Discard => {
                self.send(FilterMessage::Reply(Reply::Discard(Discard)))
                    .await
            }
            Event::Skip => self.send(FilterMessage::Reply(Reply::Skip(Skip))).await,
            Event::Progress => {
                self.send(FilterMessage::Reply(Reply::Progress(Progress)))
                    .await
            }
            Event::ReplyCode(code) => {
                self.send(FilterMessage::Reply(Reply::Replycode(code))).await
            }
            Event::Quarantine(quarantine) => {
                self.send(FilterMessage::Modification(Modification::Quarantine(
                    quarantine,
                )))
                .await
            }
            Event::AddHeader(add) => {
                self.send(FilterMessage::Modification(Modification::AddHeader(add)))
                    .await
            }
            Event::InsertHeader(insert) => {
                self.send(FilterMessage::Modification(Modification::InsertHeader(
                    insert,
                )))
                .await
            }
            Event::ChangeHeader(change) => {
                self.send(FilterMessage::Modification(Modification::ChangeHeader(
                    change,
                )))
                .await
            }
            Event::ChangeFrom(change) => {
                self.send(FilterMessage::Modification(Modification::ChangeFrom(change)))
                    .await
            }
            Event::AddRecipient(add) => {
                self.send(FilterMessage::Modification(Modification::AddRecipient(add)))
                    .await
            }
            Event::AddRecipientPar(add) => {
                self.send(FilterMessage::Modification(Modification::AddRecipientPar(
                    add,
                )))
                .await
            }
            Event::DeleteRecipient(delete) => {
                self.send(FilterMessage::Modification(Modification::DeleteRecipient(
                    delete,
                )))
                .await
            }
            Event::ReplaceBody(chunk) => {
                self.send(FilterMessage::Modification(Modification::ReplaceBody(
                    ReplaceBody::new(&chunk),
                )))
                .await
            }
            Event::Shutdown => {
                self.shutdown = true;
                Ok(())
            }
            // Lifecycle notices have no frame of their own
            Event::ConnectionFailure | Event::Finished => Ok(()),
            Event::Error { backend, message } => {
                warn!(
                    backend = backend.as_deref().unwrap_or("?"),
                    "backend trouble: {message}"
                );
                Ok(())
            }
        }
    }
}
