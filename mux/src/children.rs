//! The multiplexer instance: one MTA conversation fanned out to a pool of
//! backend filter sessions

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, info, warn};

use muxtr_proto::commands::{
    Body, Command, Connect, Data, EndOfHeader, EndOfMessage, Header, Helo, Macro, Mail, Recipient,
    Unknown,
};
use muxtr_proto::mods::Modification;
use muxtr_proto::optneg::OptNeg;
use muxtr_proto::wire::FilterReply;
use muxtr_proto::ProtocolError;

use crate::backend::{Backend, BoxedIo, Connector, NetConnector};
use crate::error::MuxError;
use crate::event::{Event, EventSink};
use crate::headers::Headers;
use crate::sequence::{Phase, Sequencer};
use crate::session::{BackendSession, SessionId, SessionOutcome, Stage};
use crate::spool::{BodySpool, FileSpool};
use crate::verdict::{Verdict, VerdictBoard};

/// Tunables applying to a whole [`Children`] instance
#[derive(Debug, Clone)]
pub struct ChildrenConfig {
    /// How long to wait before the single reconnect attempt after a failed
    /// backend connection
    pub retry_connect_delay: Duration,
    /// Whether we may start backend processes via their launch command when
    /// connecting fails
    pub privilege: bool,
    /// The verdict handed to the MTA when not a single backend could be
    /// negotiated with
    pub fallback_verdict: Verdict,
}

impl Default for ChildrenConfig {
    fn default() -> Self {
        Self {
            retry_connect_delay: Duration::from_secs(5),
            privilege: false,
            fallback_verdict: Verdict::TemporaryFailure,
        }
    }
}

/// A pending connect attempt, tracked so it can be told apart from its
/// retry and abandoned wholesale
struct NegotiateAttempt {
    backend: usize,
    is_retry: bool,
}

type ConnectAttempt = Pin<Box<dyn Future<Output = (u64, io::Result<BoxedIo>)> + Send>>;

type SpoolFactory = Box<dyn Fn() -> io::Result<Box<dyn BodySpool>> + Send + Sync>;

/// The multiplexer core for one MTA connection.
///
/// Owns one [`BackendSession`] per reachable backend, fans each stage
/// command out to the sessions whose step flags want it, folds their
/// replies into a single per-stage verdict and emits the result as
/// [`Event`]s into the sink passed to each operation.
///
/// The post-DATA tail of the message (end-of-header, body chunks,
/// end-of-message) is pipelined instead of fanned out: one session at a
/// time walks the whole tail, with the body replayed from the spool for
/// every session after the first.
pub struct Children {
    backends: Vec<Backend>,
    config: ChildrenConfig,
    connector: Arc<dyn Connector>,
    spool_factory: SpoolFactory,

    milters: Vec<BackendSession>,
    quitted: Vec<BackendSession>,
    reply_queue: VecDeque<SessionId>,
    sequencer: Sequencer,
    board: VerdictBoard,
    current_stage: Stage,
    reply_code: Option<muxtr_proto::replies::Replycode>,
    offered_option: OptNeg,
    option: Option<OptNeg>,
    headers: Headers,

    body: Option<Box<dyn BodySpool>>,
    replacement: Option<Box<dyn BodySpool>>,
    trailing_chunk: BytesMut,
    replay_mode: bool,
    sent_body_count: u32,
    replaced_body: bool,
    leader: Option<SessionId>,

    pending_negotiate: HashMap<u64, NegotiateAttempt>,
    next_attempt_id: u64,
    next_session_id: SessionId,
    flow_emitted: u64,
}

impl Children {
    /// A multiplexer for `backends`, connecting over real sockets
    #[must_use]
    pub fn new(backends: Vec<Backend>, config: ChildrenConfig) -> Self {
        Self {
            backends,
            config,
            connector: Arc::new(NetConnector),
            spool_factory: Box::new(|| {
                FileSpool::create().map(|spool| Box::new(spool) as Box<dyn BodySpool>)
            }),
            milters: Vec::new(),
            quitted: Vec::new(),
            reply_queue: VecDeque::new(),
            sequencer: Sequencer::default(),
            board: VerdictBoard::default(),
            current_stage: Stage::Start,
            reply_code: None,
            offered_option: OptNeg::default(),
            option: None,
            headers: Headers::new(),
            body: None,
            replacement: None,
            trailing_chunk: BytesMut::new(),
            replay_mode: false,
            sent_body_count: 0,
            replaced_body: false,
            leader: None,
            pending_negotiate: HashMap::new(),
            next_attempt_id: 0,
            next_session_id: 0,
            flow_emitted: 0,
        }
    }

    /// Substitute how backend transports are opened
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Substitute how body spools are created
    #[must_use]
    pub fn with_spool_factory(
        mut self,
        factory: impl Fn() -> io::Result<Box<dyn BodySpool>> + Send + Sync + 'static,
    ) -> Self {
        self.spool_factory = Box::new(factory);
        self
    }

    /// The option set merged across all negotiated backends, if
    /// negotiation has finished
    #[must_use]
    pub fn merged_option(&self) -> Option<&OptNeg> {
        self.option.as_ref()
    }

    /// How many backend sessions are still live
    #[must_use]
    pub fn live_backends(&self) -> usize {
        self.milters.len()
    }

    /// The stage the conversation is currently in
    #[must_use]
    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    // ----- facade: negotiation ------------------------------------------

    /// Connect and negotiate with every configured backend.
    ///
    /// `option` is what the MTA offered. Backends that refuse the first
    /// connection attempt are retried once after the configured delay,
    /// with their launch command run first in privilege mode. One
    /// [`Event::NegotiateReply`] carries the merged result; if no backend
    /// survives, [`Event::ConnectionFailure`] and the configured fallback
    /// verdict are emitted instead.
    ///
    /// # Errors
    /// Only sink failures abort this; backend failures are isolated.
    pub async fn negotiate(
        &mut self,
        option: OptNeg,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.begin_stage(Stage::Negotiate);
        self.offered_option = option.clone();
        self.option = None;

        let mut attempts: FuturesUnordered<ConnectAttempt> = FuturesUnordered::new();
        for index in 0..self.backends.len() {
            attempts.push(self.track_attempt(index, false, Duration::ZERO));
        }

        while let Some((attempt_id, opened)) = attempts.next().await {
            let Some(attempt) = self.pending_negotiate.remove(&attempt_id) else {
                continue;
            };

            match opened {
                Ok(io) => {
                    let id = self.adopt_session(attempt.backend, io);
                    self.reply_queue.push_back(id);
                    let mut sent = Ok(());
                    if let Some(session) = self.session_mut(id) {
                        sent = session.negotiate(&option).await;
                    }
                    if let Err(send_error) = sent {
                        self.reply_queue.retain(|&queued| queued != id);
                        self.expire_with_error(id, &send_error, sink).await?;
                    }
                }
                Err(connect_error) => {
                    let backend = &self.backends[attempt.backend];
                    let timed_out = connect_error.kind() == io::ErrorKind::TimedOut;
                    if attempt.is_retry || timed_out {
                        error!(
                            backend = %backend.name,
                            error = %connect_error,
                            "backend unreachable, giving up on it"
                        );
                        let name = backend.name.clone();
                        Self::emit(
                            &mut self.flow_emitted,
                            sink,
                            Event::Error {
                                backend: Some(name),
                                message: connect_error.to_string(),
                            },
                        )
                        .await?;
                        continue;
                    }

                    warn!(
                        backend = %backend.name,
                        error = %connect_error,
                        "connect failed, retrying after {:?}",
                        self.config.retry_connect_delay
                    );
                    if self.config.privilege {
                        if let Some(command) = backend.launch_command.clone() {
                            if let Err(spawn_error) = start_filter_process(&command) {
                                let name = backend.name.clone();
                                Self::emit(
                                    &mut self.flow_emitted,
                                    sink,
                                    Event::Error {
                                        backend: Some(name),
                                        message: spawn_error.to_string(),
                                    },
                                )
                                .await?;
                                continue;
                            }
                        }
                    }
                    let retry = self.track_attempt(
                        attempt.backend,
                        true,
                        self.config.retry_connect_delay,
                    );
                    attempts.push(retry);
                }
            }
        }

        self.pump_reply_queue(sink).await?;

        if self.milters.is_empty() && self.option.is_none() {
            Self::emit(&mut self.flow_emitted, sink, Event::ConnectionFailure).await?;
            let fallback = Event::from_verdict(self.config.fallback_verdict);
            Self::emit(&mut self.flow_emitted, sink, fallback).await?;
        }
        Ok(())
    }

    // ----- facade: fanned-out stages ------------------------------------

    /// Report the SMTP client connection
    ///
    /// # Errors
    /// Sink and spool failures only; backend failures are isolated.
    pub async fn connect(
        &mut self,
        connect: Connect,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.fan_out(Stage::Connect, Command::Connect(connect), sink)
            .await
    }

    /// Report the HELO/EHLO name
    ///
    /// # Errors
    /// Sink and spool failures only; backend failures are isolated.
    pub async fn helo(&mut self, helo: Helo, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        self.fan_out(Stage::Helo, Command::Helo(helo), sink).await
    }

    /// Report the envelope sender
    ///
    /// # Errors
    /// Sink and spool failures only; backend failures are isolated.
    pub async fn envelope_from(
        &mut self,
        mail: Mail,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.fan_out(Stage::MailFrom, Command::Mail(mail), sink)
            .await
    }

    /// Report one envelope recipient
    ///
    /// # Errors
    /// Sink and spool failures only; backend failures are isolated.
    pub async fn envelope_recipient(
        &mut self,
        recipient: Recipient,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.fan_out(Stage::RcptTo, Command::Recipient(recipient), sink)
            .await
    }

    /// Report the DATA command
    ///
    /// # Errors
    /// Sink and spool failures only; backend failures are isolated.
    pub async fn data(&mut self, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        self.fan_out(Stage::Data, Command::Data(Data), sink).await
    }

    /// Report one message header
    ///
    /// # Errors
    /// Sink and spool failures only; backend failures are isolated.
    pub async fn header(
        &mut self,
        header: Header,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.headers
            .add(header.name().as_bytes(), header.value().as_bytes());
        self.fan_out(Stage::Header, Command::Header(header), sink)
            .await
    }

    /// Report a command the MTA did not recognize
    ///
    /// # Errors
    /// Sink and spool failures only; backend failures are isolated.
    pub async fn unknown(
        &mut self,
        unknown: Unknown,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.fan_out(Stage::Unknown, Command::Unknown(unknown), sink)
            .await
    }

    /// Relay a macro set to every live backend; macros have no reply
    ///
    /// # Errors
    /// Sink failures only; backend failures are isolated.
    pub async fn macro_forward(
        &mut self,
        macro_: Macro,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        let mut broken = Vec::new();
        for session in &mut self.milters {
            if let Err(send_error) = session.forward_macro(macro_.clone()).await {
                broken.push((session.id, send_error));
            }
        }
        for (id, send_error) in broken {
            self.expire_with_error(id, &send_error, sink).await?;
        }
        Ok(())
    }

    // ----- facade: the sequenced post-DATA tail -------------------------

    /// All headers are in; start the sequenced tail of the message
    ///
    /// # Errors
    /// Sink and spool failures only; backend failures are isolated.
    pub async fn end_of_header(&mut self, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        let baseline = self.flow_emitted;
        self.current_stage = Stage::EndOfHeader;
        self.sequencer
            .begin(Phase::EndOfHeader, self.milters.iter().map(|s| s.id));

        self.catch_up(sink).await?;
        self.pump_while_quiet(baseline, sink).await
    }

    /// Spool one body chunk and stream it to the leading session
    ///
    /// # Errors
    /// [`MuxError::Spool`] if the chunk cannot be spooled; sink failures.
    pub async fn body(&mut self, body: Body, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        let baseline = self.flow_emitted;
        self.current_stage = Stage::Body;
        self.sequencer
            .begin(Phase::Body, self.milters.iter().map(|s| s.id));

        self.spool_body(body.as_bytes(), sink).await?;

        if let Some(id) = self.live_body_target() {
            let skipping = self
                .session(id)
                .is_some_and(|session| session.skip_body);
            if !skipping {
                self.leader = Some(id);
                let mut sent = Ok(false);
                if let Some(session) = self.session_mut(id) {
                    sent = session.dispatch(Stage::Body, Command::Body(body)).await;
                }
                match sent {
                    Ok(true) => self.sent_body_count += 1,
                    Ok(false) => {}
                    Err(send_error) => self.fail_session(id, &send_error, sink).await?,
                }
            }
        }

        self.pump_while_quiet(baseline, sink).await
    }

    /// The body is complete; run every remaining session through the tail
    /// and emit the final verdict plus any collected modifications
    ///
    /// # Errors
    /// [`MuxError::Spool`] if the spool cannot be rewound; sink failures.
    pub async fn end_of_message(
        &mut self,
        end: EndOfMessage,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        if self.milters.is_empty() {
            return Ok(());
        }

        let baseline = self.flow_emitted;
        self.current_stage = Stage::EndOfMessage;
        self.sequencer
            .begin(Phase::EndOfMessage, self.milters.iter().map(|s| s.id));
        self.trailing_chunk = BytesMut::from(end.as_bytes());
        // Per-chunk acknowledgments to the MTA are over from here on
        self.replay_mode = true;

        if let Some(spool) = self.body.as_mut() {
            if let Err(io_error) = spool.rewind().await {
                Self::emit(
                    &mut self.flow_emitted,
                    sink,
                    Event::Error {
                        backend: None,
                        message: io_error.to_string(),
                    },
                )
                .await?;
                return Err(MuxError::Spool(io_error));
            }
        }

        self.catch_up(sink).await?;
        self.pump_while_quiet(baseline, sink).await
    }

    // ----- facade: control ----------------------------------------------

    /// Drop the current message on every backend and reset message state;
    /// the sessions stay usable for the next message
    ///
    /// # Errors
    /// Sink failures only.
    pub async fn abort(&mut self, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        self.current_stage = Stage::Abort;

        let mut broken = Vec::new();
        for session in &mut self.milters {
            if let Err(send_error) = session.abort().await {
                broken.push((session.id, send_error));
            }
        }
        for (id, send_error) in broken {
            self.expire_with_error(id, &send_error, sink).await?;
        }

        self.reset_message_state().await;
        Ok(())
    }

    /// Close every backend session and emit [`Event::Finished`]
    ///
    /// # Errors
    /// Sink failures only.
    pub async fn quit(&mut self, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        self.current_stage = Stage::Quit;

        for session in &mut self.milters {
            if let Err(send_error) = session.quit().await {
                debug!(backend = %session.name, error = %send_error, "quit send failed");
            }
        }
        self.quitted.append(&mut self.milters);
        self.reply_queue.clear();
        self.leader = None;

        Self::emit(&mut self.flow_emitted, sink, Event::Finished).await
    }

    // ----- stage plumbing -----------------------------------------------

    async fn emit(
        flow_counter: &mut u64,
        sink: &mut dyn EventSink,
        event: Event,
    ) -> Result<(), MuxError> {
        if event.is_flow() {
            *flow_counter += 1;
        }
        sink.emit(event).await.map_err(MuxError::Emit)
    }

    fn begin_stage(&mut self, stage: Stage) {
        self.reply_queue.clear();
        self.current_stage = stage;
        self.board.reset(stage);
    }

    fn session(&self, id: SessionId) -> Option<&BackendSession> {
        self.milters.iter().find(|session| session.id == id)
    }

    fn session_mut(&mut self, id: SessionId) -> Option<&mut BackendSession> {
        self.milters.iter_mut().find(|session| session.id == id)
    }

    fn adopt_session(&mut self, backend_index: usize, io: BoxedIo) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let backend = &self.backends[backend_index];
        self.milters.push(BackendSession::new(
            id,
            backend.name.clone(),
            io,
            backend.timeouts,
        ));
        id
    }

    fn track_attempt(
        &mut self,
        backend_index: usize,
        is_retry: bool,
        delay: Duration,
    ) -> ConnectAttempt {
        let attempt_id = self.next_attempt_id;
        self.next_attempt_id += 1;
        self.pending_negotiate.insert(
            attempt_id,
            NegotiateAttempt {
                backend: backend_index,
                is_retry,
            },
        );

        let connector = Arc::clone(&self.connector);
        let backend = self.backends[backend_index].clone();
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let opened =
                tokio::time::timeout(backend.timeouts.connect, connector.open(&backend)).await;
            let result = match opened {
                Ok(result) => result,
                Err(_elapsed) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect attempt timed out",
                )),
            };
            (attempt_id, result)
        })
    }

    async fn fan_out(
        &mut self,
        stage: Stage,
        command: Command,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.begin_stage(stage);

        let mut enrolled = Vec::new();
        let mut broken = Vec::new();
        for session in &mut self.milters {
            if session.excluded_from(stage) {
                continue;
            }
            // Best effort: one failing send must not stop the others
            match session.dispatch(stage, command.clone()).await {
                Ok(true) => enrolled.push(session.id),
                Ok(false) => {}
                Err(send_error) => broken.push((session.id, send_error)),
            }
        }
        self.reply_queue.extend(enrolled);
        for (id, send_error) in broken {
            self.expire_with_error(id, &send_error, sink).await?;
        }

        self.pump_reply_queue(sink).await
    }

    async fn pump_reply_queue(&mut self, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        while !self.reply_queue.is_empty() {
            let Some((id, outcome)) = self.next_session_event().await else {
                debug!(stage = %self.current_stage, "reply queue left without awaiting sessions");
                self.reply_queue.clear();
                break;
            };
            self.handle_outcome(id, outcome, sink).await?;
        }
        Ok(())
    }

    async fn pump_while_quiet(
        &mut self,
        baseline: u64,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        while self.flow_emitted == baseline {
            let Some((id, outcome)) = self.next_session_event().await else {
                break;
            };
            self.handle_outcome(id, outcome, sink).await?;
        }
        Ok(())
    }

    async fn next_session_event(&mut self) -> Option<(SessionId, SessionOutcome)> {
        let waiters: Vec<_> = self
            .milters
            .iter_mut()
            .filter(|session| session.is_awaiting())
            .map(|session| Box::pin(session.wait()))
            .collect();
        if waiters.is_empty() {
            return None;
        }

        let ((id, outcome), _index, _remaining) = futures::future::select_all(waiters).await;
        Some((id, outcome))
    }

    async fn handle_outcome(
        &mut self,
        id: SessionId,
        outcome: SessionOutcome,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        match outcome {
            SessionOutcome::Reply(reply) => self.on_reply(id, reply, sink).await,
            SessionOutcome::TimedOut => {
                let timeout_error = io::Error::new(io::ErrorKind::TimedOut, "reply timed out");
                self.fail_session(id, &timeout_error, sink).await
            }
            SessionOutcome::Failed(transport_error) => {
                self.fail_session(id, &transport_error, sink).await
            }
            SessionOutcome::Closed => self.on_closed(id, sink).await,
        }
    }

    /// Emit an error for `id`, expire it and repair whatever the current
    /// stage was waiting on from it
    async fn fail_session(
        &mut self,
        id: SessionId,
        reason: &(dyn std::fmt::Display + Sync),
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.expire_with_error(id, reason, sink).await?;
        self.repair_stage_after_loss(id, sink).await
    }

    /// Emit an error for `id` and expire it, leaving stage repair to the
    /// caller
    async fn expire_with_error(
        &mut self,
        id: SessionId,
        reason: &(dyn std::fmt::Display + Sync),
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        let name = self.session(id).map(|session| session.name.clone());
        error!(
            backend = name.as_deref().unwrap_or("?"),
            stage = %self.current_stage,
            "{reason}"
        );
        Self::emit(
            &mut self.flow_emitted,
            sink,
            Event::Error {
                backend: name,
                message: reason.to_string(),
            },
        )
        .await?;
        self.expire(id);
        Ok(())
    }

    /// Move `id` from the live list to the quitted list and out of all
    /// queues. The expired session no longer contributes to any stage.
    fn expire(&mut self, id: SessionId) {
        if let Some(position) = self.milters.iter().position(|session| session.id == id) {
            self.quitted.push(self.milters.remove(position));
        }
        self.sequencer.remove(id);
        if self.leader == Some(id) {
            self.leader = None;
        }
    }

    async fn repair_stage_after_loss(
        &mut self,
        id: SessionId,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        match self.current_stage {
            Stage::EndOfHeader | Stage::Body | Stage::EndOfMessage => {
                // Losing the leader mid-pipeline: the next session takes
                // over as if the lost one had been absent all along
                if self.leader.is_none() {
                    self.replay_mode = true;
                    self.catch_up(sink).await?;
                }
                Ok(())
            }
            _ => self.resolve_in_queue(id, sink).await.map(|_| ()),
        }
    }

    async fn on_closed(&mut self, id: SessionId, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        let name = self
            .session(id)
            .map_or_else(|| "?".to_string(), |session| session.name.clone());
        info!(backend = %name, stage = %self.current_stage, "backend closed its connection");

        let was_leader = self.leader == Some(id);
        self.expire(id);

        match self.current_stage {
            Stage::EndOfHeader | Stage::Body | Stage::EndOfMessage => {
                if was_leader {
                    self.replay_mode = true;
                    self.catch_up(sink).await?;
                }
            }
            _ => {
                let drained = self.resolve_in_queue(id, sink).await?;
                if drained {
                    Self::emit(&mut self.flow_emitted, sink, Event::Finished).await?;
                }
            }
        }
        Ok(())
    }

    /// Take `id` out of the reply queue; when that resolves the stage,
    /// emit the aggregate and apply its consequences. Returns whether the
    /// queue drained.
    async fn resolve_in_queue(
        &mut self,
        id: SessionId,
        sink: &mut dyn EventSink,
    ) -> Result<bool, MuxError> {
        let before = self.reply_queue.len();
        self.reply_queue.retain(|&queued| queued != id);
        if before == self.reply_queue.len() || !self.reply_queue.is_empty() {
            return Ok(false);
        }

        self.settle_stage(sink).await?;
        Ok(true)
    }

    async fn settle_stage(&mut self, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        if self.current_stage == Stage::Negotiate {
            if let Some(option) = self.option.clone() {
                Self::emit(&mut self.flow_emitted, sink, Event::NegotiateReply(option)).await?;
            }
            return Ok(());
        }

        let verdict = self.board.get(self.current_stage);

        if let Some(code) = self.reply_code.take() {
            Self::emit(&mut self.flow_emitted, sink, Event::ReplyCode(code)).await?;
        } else if verdict != Verdict::NotChange && self.current_stage != Stage::Body {
            Self::emit(&mut self.flow_emitted, sink, Event::from_verdict(verdict)).await?;
        }

        match verdict {
            Verdict::Reject if self.current_stage != Stage::RcptTo => self.expire_all(sink).await,
            Verdict::Discard => self.expire_all(sink).await,
            _ => Ok(()),
        }
    }

    /// Abort and quit every live session, expire them all, and report the
    /// message as finished
    async fn expire_all(&mut self, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        let ids: Vec<SessionId> = self.milters.iter().map(|session| session.id).collect();
        for id in ids {
            if let Some(session) = self.session_mut(id) {
                if let Err(send_error) = session.abort().await {
                    debug!(error = %send_error, "abort send failed during teardown");
                }
            }
            if let Some(session) = self.session_mut(id) {
                if let Err(send_error) = session.quit().await {
                    debug!(error = %send_error, "quit send failed during teardown");
                }
            }
            self.expire(id);
        }
        self.reply_queue.clear();

        Self::emit(&mut self.flow_emitted, sink, Event::Finished).await
    }

    async fn reset_message_state(&mut self) {
        self.sequencer.reset();
        self.board.reset_all();
        self.headers.clear();
        self.reply_queue.clear();
        self.reply_code = None;
        // The body spool is kept for the next message, emptied
        if let Some(spool) = self.body.as_mut() {
            if let Err(clear_error) = spool.clear().await {
                debug!(error = %clear_error, "could not empty the body spool");
                self.body = None;
            }
        }
        self.replacement = None;
        self.trailing_chunk.clear();
        self.replay_mode = false;
        self.sent_body_count = 0;
        self.replaced_body = false;
        self.leader = None;
        for session in &mut self.milters {
            session.stage = Stage::Start;
            session.skip_body = false;
        }
    }

    // ----- reply handling -----------------------------------------------

    async fn on_reply(
        &mut self,
        id: SessionId,
        reply: FilterReply,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        let Some(stage) = self.session(id).map(|session| session.stage) else {
            return Ok(());
        };
        debug!(
            backend = %self.session(id).map_or_else(String::new, |s| s.name.clone()),
            %stage,
            %reply,
            "backend replied"
        );

        match reply {
            FilterReply::OptNeg(options) => self.on_negotiate_reply(id, options, sink).await,
            FilterReply::Continue(_) => self.on_continue(id, stage, sink).await,
            FilterReply::Accept(_) => self.on_accept(id, stage, sink).await,
            FilterReply::Reject(_) => self.on_reject(id, stage, sink).await,
            FilterReply::TemporaryFailure(_) => {
                self.on_temporary_failure(id, stage, sink).await
            }
            FilterReply::Discard(_) => self.on_discard(id, stage, sink).await,
            FilterReply::Skip(_) => self.on_skip(id, stage, sink).await,
            FilterReply::Progress(_) => self.on_progress(id, stage, sink).await,
            FilterReply::Replycode(code) => self.on_reply_code(id, stage, code, sink).await,
            FilterReply::AddHeader(add) => {
                self.on_modification(id, stage, Modification::AddHeader(add), sink)
                    .await
            }
            FilterReply::InsertHeader(insert) => {
                self.on_modification(id, stage, Modification::InsertHeader(insert), sink)
                    .await
            }
            FilterReply::ChangeHeader(change) => {
                self.on_modification(id, stage, Modification::ChangeHeader(change), sink)
                    .await
            }
            FilterReply::ChangeFrom(change) => {
                self.on_modification(id, stage, Modification::ChangeFrom(change), sink)
                    .await
            }
            FilterReply::AddRecipient(add) => {
                self.on_modification(id, stage, Modification::AddRecipient(add), sink)
                    .await
            }
            FilterReply::AddRecipientPar(add) => {
                self.on_modification(id, stage, Modification::AddRecipientPar(add), sink)
                    .await
            }
            FilterReply::DeleteRecipient(delete) => {
                self.on_modification(id, stage, Modification::DeleteRecipient(delete), sink)
                    .await
            }
            FilterReply::ReplaceBody(chunk) => {
                self.on_modification(id, stage, Modification::ReplaceBody(chunk), sink)
                    .await
            }
            FilterReply::Quarantine(quarantine) => {
                self.on_modification(id, stage, Modification::Quarantine(quarantine), sink)
                    .await
            }
        }
    }

    async fn on_negotiate_reply(
        &mut self,
        id: SessionId,
        options: OptNeg,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        if self.current_stage != Stage::Negotiate {
            warn!("option negotiation reply outside the negotiate stage");
            self.quit_session(id).await;
            return self.resolve_in_queue(id, sink).await.map(|_| ());
        }

        // A backend demanding a newer protocol than the MTA offered cannot
        // be spoken to for this message
        if let Err(version_error) = self.offered_option.clone().merge_compatible(&options) {
            warn!(%version_error, "dropping backend after negotiation");
            self.quit_session(id).await;
            return self.resolve_in_queue(id, sink).await.map(|_| ());
        }

        if let Some(session) = self.session_mut(id) {
            session.options = options.clone();
        }
        self.option = Some(match self.option.take() {
            Some(merged) => merged.merge_filters(&options),
            None => options,
        });

        self.resolve_in_queue(id, sink).await.map(|_| ())
    }

    async fn on_continue(
        &mut self,
        id: SessionId,
        stage: Stage,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.board.compile(stage, Verdict::Continue);
        match stage {
            Stage::EndOfHeader => self.advance_session(id, sink).await,
            Stage::Body => {
                self.sent_body_count = self.sent_body_count.saturating_sub(1);
                if !self.replay_mode {
                    Self::emit(&mut self.flow_emitted, sink, Event::Continue).await
                } else if self.sent_body_count == 0 {
                    self.advance_session(id, sink).await
                } else {
                    Ok(())
                }
            }
            Stage::EndOfMessage => self.rotate_leader(id, true, sink).await,
            _ => self.resolve_in_queue(id, sink).await.map(|_| ()),
        }
    }

    async fn on_accept(
        &mut self,
        id: SessionId,
        stage: Stage,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.board.compile(stage, Verdict::Accept);
        match stage {
            // Done with the whole message; hand the pipeline onward
            Stage::Body | Stage::EndOfMessage => self.rotate_leader(id, true, sink).await,
            _ => {
                self.quit_session(id).await;
                self.resolve_in_queue(id, sink).await.map(|_| ())
            }
        }
    }

    async fn on_reject(
        &mut self,
        id: SessionId,
        stage: Stage,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.board.compile(stage, Verdict::Reject);
        match stage {
            // Rejecting one recipient does not end the message
            Stage::RcptTo => self.resolve_in_queue(id, sink).await.map(|_| ()),
            Stage::EndOfMessage => {
                if let Some(code) = self.reply_code.take() {
                    Self::emit(&mut self.flow_emitted, sink, Event::ReplyCode(code)).await?;
                } else {
                    Self::emit(&mut self.flow_emitted, sink, Event::Reject).await?;
                }
                self.expire_all(sink).await
            }
            _ => {
                self.quit_session(id).await;
                self.resolve_in_queue(id, sink).await.map(|_| ())
            }
        }
    }

    async fn on_temporary_failure(
        &mut self,
        id: SessionId,
        stage: Stage,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.board.compile(stage, Verdict::TemporaryFailure);
        match stage {
            Stage::RcptTo => self.resolve_in_queue(id, sink).await.map(|_| ()),
            Stage::EndOfMessage => {
                Self::emit(&mut self.flow_emitted, sink, Event::TemporaryFailure).await?;
                self.expire_all(sink).await
            }
            _ => {
                self.quit_session(id).await;
                self.resolve_in_queue(id, sink).await.map(|_| ())
            }
        }
    }

    async fn on_discard(
        &mut self,
        id: SessionId,
        stage: Stage,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.board.compile(stage, Verdict::Discard);
        match stage {
            Stage::EndOfMessage => {
                Self::emit(&mut self.flow_emitted, sink, Event::Discard).await?;
                self.expire_all(sink).await
            }
            _ => {
                self.quit_session(id).await;
                self.resolve_in_queue(id, sink).await.map(|_| ())
            }
        }
    }

    async fn on_skip(
        &mut self,
        id: SessionId,
        stage: Stage,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        if stage != Stage::Body {
            warn!(%stage, "SKIP reply is only allowed for body chunks");
            self.quit_session(id).await;
            return self.repair_stage_after_loss(id, sink).await;
        }

        self.board.compile(Stage::Body, Verdict::Skip);
        if let Some(session) = self.session_mut(id) {
            session.skip_body = true;
        }

        if self.replay_mode {
            self.advance_session(id, sink).await
        } else {
            Self::emit(&mut self.flow_emitted, sink, Event::Continue).await
        }
    }

    async fn on_progress(
        &mut self,
        id: SessionId,
        stage: Stage,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        if stage == Stage::EndOfMessage {
            Self::emit(&mut self.flow_emitted, sink, Event::Progress).await?;
        } else {
            warn!(%stage, "PROGRESS reply is only allowed at end-of-message");
        }
        // The real answer is still owed
        if let Some(session) = self.session_mut(id) {
            session.expect_reply(stage);
        }
        Ok(())
    }

    async fn on_reply_code(
        &mut self,
        id: SessionId,
        stage: Stage,
        code: muxtr_proto::replies::Replycode,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        // SMTP 421 is the conventional "shut the connection down" reply
        if code.smtp_code() == 421 {
            Self::emit(&mut self.flow_emitted, sink, Event::Shutdown).await?;
        }
        self.reply_code = Some(code);
        self.on_reject(id, stage, sink).await
    }

    async fn on_modification(
        &mut self,
        id: SessionId,
        stage: Stage,
        modification: Modification,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        // Only forward what the negotiated action flags admit
        let admitted = self.option.as_ref().map_or(true, |option| {
            option
                .capabilities
                .contains(modification.required_capability())
        });
        if !admitted {
            warn!(%modification, "modification outside the negotiated action flags");
            if let Some(session) = self.session_mut(id) {
                session.expect_reply(stage);
            }
            return Ok(());
        }

        match modification {
            Modification::Quarantine(quarantine) => {
                if stage != Stage::EndOfMessage {
                    warn!(%stage, "QUARANTINE reply is only allowed at end-of-message");
                    self.quit_session(id).await;
                    return self.repair_stage_after_loss(id, sink).await;
                }
                Self::emit(&mut self.flow_emitted, sink, Event::Quarantine(quarantine)).await?;
            }
            Modification::AddHeader(add) => {
                self.headers
                    .add(add.name().as_bytes(), add.value().as_bytes());
                Self::emit(&mut self.flow_emitted, sink, Event::AddHeader(add)).await?;
            }
            Modification::InsertHeader(insert) => {
                self.headers.insert(
                    insert.index(),
                    insert.name().as_bytes(),
                    insert.value().as_bytes(),
                );
                Self::emit(&mut self.flow_emitted, sink, Event::InsertHeader(insert)).await?;
            }
            Modification::ChangeHeader(change) => {
                self.headers.change(
                    change.name().as_bytes(),
                    change.index(),
                    change.value().as_bytes(),
                );
                Self::emit(&mut self.flow_emitted, sink, Event::ChangeHeader(change)).await?;
            }
            Modification::ChangeFrom(change) => {
                Self::emit(&mut self.flow_emitted, sink, Event::ChangeFrom(change)).await?;
            }
            Modification::AddRecipient(add) => {
                Self::emit(&mut self.flow_emitted, sink, Event::AddRecipient(add)).await?;
            }
            Modification::AddRecipientPar(add) => {
                Self::emit(&mut self.flow_emitted, sink, Event::AddRecipientPar(add)).await?;
            }
            Modification::DeleteRecipient(delete) => {
                Self::emit(&mut self.flow_emitted, sink, Event::DeleteRecipient(delete)).await?;
            }
            Modification::ReplaceBody(chunk) => {
                self.append_replacement(chunk.as_bytes(), sink).await?;
            }
        }

        // Whatever this was, the stage's final action is still owed
        if let Some(session) = self.session_mut(id) {
            session.expect_reply(stage);
        }
        Ok(())
    }

    // ----- the sequenced pipeline ---------------------------------------

    /// The next issued phase `id` is still owed and eligible for.
    ///
    /// Starts right after the phase the session has already reached and
    /// walks the issued commands, skipping phases its step flags (or an
    /// earlier SKIP reply) exclude it from.
    fn next_phase_for(&self, id: SessionId) -> Option<Phase> {
        let session = self.session(id)?;
        let mut candidate = match session.stage {
            Stage::EndOfHeader => self.sequencer.next_after(Phase::EndOfHeader),
            Stage::Body => self.sequencer.next_after(Phase::Body),
            Stage::EndOfMessage => None,
            _ => self.sequencer.commands().first().copied(),
        };

        while let Some(phase) = candidate {
            let eligible = match phase {
                Phase::EndOfHeader => !session.excluded_from(Stage::EndOfHeader),
                Phase::Body => !session.excluded_from(Stage::Body) && !session.skip_body,
                Phase::EndOfMessage => true,
            };
            if eligible {
                return Some(phase);
            }
            candidate = self.sequencer.next_after(phase);
        }
        None
    }

    /// The first waiting session that still has pipeline work
    fn next_catch_up(&self) -> Option<(SessionId, Phase)> {
        self.sequencer
            .waiting()
            .find_map(|id| self.next_phase_for(id).map(|phase| (id, phase)))
    }

    /// The session live body chunks go to: the first waiting one whose
    /// step flags admit body at all. Skip handling happens at the caller.
    fn live_body_target(&self) -> Option<SessionId> {
        self.sequencer.waiting().find(|&id| {
            self.session(id)
                .is_some_and(|session| !session.excluded_from(Stage::Body))
        })
    }

    /// Feed the first waiting session with pipeline work, or finish the
    /// stage when nobody is left
    async fn catch_up(&mut self, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        loop {
            let Some((id, phase)) = self.next_catch_up() else {
                return self.finish_sequenced_stage(sink).await;
            };
            self.leader = Some(id);

            match phase {
                Phase::EndOfHeader => match self.dispatch_end_of_header(id).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(send_error) => {
                        self.expire_with_error(id, &send_error, sink).await?;
                    }
                },
                Phase::Body => {
                    if self.replay_body_to(id, sink).await? {
                        return Ok(());
                    }
                }
                Phase::EndOfMessage => match self.dispatch_end_of_message(id).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(send_error) => {
                        self.expire_with_error(id, &send_error, sink).await?;
                    }
                },
            }
        }
    }

    /// Push the session that just finished a phase to its next one; when
    /// nothing is queued yet, acknowledge the stage toward the MTA
    async fn advance_session(
        &mut self,
        id: SessionId,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        loop {
            if self.session(id).is_none() {
                // The session fell over while advancing; let the next one
                // take the pipeline
                self.replay_mode = true;
                return self.catch_up(sink).await;
            }
            let Some(phase) = self.next_phase_for(id) else {
                if self.replay_mode {
                    return Ok(());
                }
                return Self::emit(&mut self.flow_emitted, sink, Event::Continue).await;
            };

            match phase {
                Phase::EndOfHeader => match self.dispatch_end_of_header(id).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(send_error) => {
                        self.expire_with_error(id, &send_error, sink).await?;
                        self.replay_mode = true;
                        return self.catch_up(sink).await;
                    }
                },
                Phase::Body => {
                    if self.replay_body_to(id, sink).await? {
                        return Ok(());
                    }
                }
                Phase::EndOfMessage => match self.dispatch_end_of_message(id).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(send_error) => {
                        self.expire_with_error(id, &send_error, sink).await?;
                        self.replay_mode = true;
                        return self.catch_up(sink).await;
                    }
                },
            }
        }
    }

    /// Hand the pipeline from `outgoing` to the next waiting session, or
    /// finish the stage when nobody is left
    async fn rotate_leader(
        &mut self,
        outgoing: SessionId,
        quit_outgoing: bool,
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        self.replay_mode = true;
        self.sequencer.remove(outgoing);
        if self.leader == Some(outgoing) {
            self.leader = None;
        }

        if quit_outgoing && self.next_catch_up().is_some() {
            self.quit_session(outgoing).await;
        }
        self.catch_up(sink).await
    }

    async fn dispatch_end_of_header(&mut self, id: SessionId) -> Result<bool, ProtocolError> {
        self.current_stage = Stage::EndOfHeader;
        let Some(session) = self.milters.iter_mut().find(|session| session.id == id) else {
            return Ok(false);
        };
        session
            .dispatch(Stage::EndOfHeader, Command::EndOfHeader(EndOfHeader))
            .await
    }

    async fn dispatch_end_of_message(&mut self, id: SessionId) -> Result<bool, ProtocolError> {
        self.current_stage = Stage::EndOfMessage;
        let trailing = EndOfMessage::from(&self.trailing_chunk[..]);
        let Some(session) = self.milters.iter_mut().find(|session| session.id == id) else {
            return Ok(false);
        };
        session
            .dispatch(Stage::EndOfMessage, Command::EndOfMessage(trailing))
            .await
    }

    /// Stream the spooled body to `id`. Returns whether replies are now
    /// outstanding; `false` means the session is already past the body.
    async fn replay_body_to(
        &mut self,
        id: SessionId,
        sink: &mut dyn EventSink,
    ) -> Result<bool, MuxError> {
        self.current_stage = Stage::Body;
        self.sent_body_count = 0;

        let Some(position) = self.milters.iter().position(|session| session.id == id) else {
            return Ok(false);
        };
        self.milters[position].stage = Stage::Body;

        let Some(spool) = self.body.as_mut() else {
            return Ok(false);
        };
        if let Err(io_error) = spool.rewind().await {
            return Err(self.spool_trouble(io_error, sink).await);
        }

        let mut sent = 0_u32;
        let mut session_error = None;
        let mut spool_error = None;
        {
            let Some(spool) = self.body.as_mut() else {
                return Ok(false);
            };
            let session = &mut self.milters[position];
            loop {
                let chunk = match spool.next_chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(io_error) => {
                        spool_error = Some(io_error);
                        break;
                    }
                };
                match session
                    .dispatch(Stage::Body, Command::Body(Body::from(&chunk[..])))
                    .await
                {
                    Ok(true) => sent += 1,
                    Ok(false) => {}
                    Err(send_error) => {
                        session_error = Some(send_error);
                        break;
                    }
                }
            }
        }

        if let Some(io_error) = spool_error {
            return Err(self.spool_trouble(io_error, sink).await);
        }

        if let Some(spool) = self.body.as_mut() {
            if let Err(io_error) = spool.rewind().await {
                return Err(self.spool_trouble(io_error, sink).await);
            }
        }

        if let Some(send_error) = session_error {
            self.expire_with_error(id, &send_error, sink).await?;
            return Ok(false);
        }

        self.sent_body_count = sent;
        Ok(sent > 0)
    }

    /// Nobody is owed pipeline work anymore: stream the replacement body
    /// if one was collected, then emit the stage verdict
    async fn finish_sequenced_stage(&mut self, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        self.leader = None;

        if self.current_stage == Stage::EndOfMessage && self.replaced_body {
            self.stream_replacement(sink).await?;
        }

        let verdict = self.board.get(self.current_stage);
        Self::emit(&mut self.flow_emitted, sink, Event::from_verdict(verdict)).await
    }

    async fn stream_replacement(&mut self, sink: &mut dyn EventSink) -> Result<(), MuxError> {
        let rewound = match self.replacement.as_mut() {
            Some(spool) => spool.rewind().await,
            None => return Ok(()),
        };
        if let Err(io_error) = rewound {
            let _trouble = self.spool_trouble(io_error, sink).await;
            return Ok(());
        }

        loop {
            let read = match self.replacement.as_mut() {
                Some(spool) => spool.next_chunk().await,
                None => break,
            };
            match read {
                Ok(Some(chunk)) => {
                    Self::emit(&mut self.flow_emitted, sink, Event::ReplaceBody(chunk)).await?;
                }
                Ok(None) => break,
                Err(io_error) => {
                    let _trouble = self.spool_trouble(io_error, sink).await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    // ----- spools --------------------------------------------------------

    async fn spool_body(&mut self, chunk: &[u8], sink: &mut dyn EventSink) -> Result<(), MuxError> {
        if self.body.is_none() {
            match (self.spool_factory)() {
                Ok(spool) => self.body = Some(spool),
                Err(io_error) => return Err(self.spool_trouble(io_error, sink).await),
            }
        }
        if chunk.is_empty() {
            return Ok(());
        }
        let append = match self.body.as_mut() {
            Some(spool) => spool.append(chunk).await,
            None => Ok(()),
        };
        match append {
            Ok(()) => Ok(()),
            Err(io_error) => Err(self.spool_trouble(io_error, sink).await),
        }
    }

    async fn append_replacement(
        &mut self,
        chunk: &[u8],
        sink: &mut dyn EventSink,
    ) -> Result<(), MuxError> {
        if self.replacement.is_none() {
            match (self.spool_factory)() {
                Ok(spool) => self.replacement = Some(spool),
                Err(io_error) => return Err(self.spool_trouble(io_error, sink).await),
            }
        }
        self.replaced_body = true;
        let append = match self.replacement.as_mut() {
            Some(spool) => spool.append(chunk).await,
            None => Ok(()),
        };
        match append {
            Ok(()) => Ok(()),
            Err(io_error) => Err(self.spool_trouble(io_error, sink).await),
        }
    }

    async fn spool_trouble(&mut self, io_error: io::Error, sink: &mut dyn EventSink) -> MuxError {
        error!(error = %io_error, "body spool failed");
        let report = Self::emit(
            &mut self.flow_emitted,
            sink,
            Event::Error {
                backend: None,
                message: io_error.to_string(),
            },
        )
        .await;
        if let Err(emit_error) = report {
            return emit_error;
        }
        MuxError::Spool(io_error)
    }

    // ----- session teardown ---------------------------------------------

    /// Quit and expire one misbehaving or finished session
    async fn quit_session(&mut self, id: SessionId) {
        if let Some(session) = self.session_mut(id) {
            if let Err(send_error) = session.quit().await {
                debug!(backend = %session.name, error = %send_error, "quit send failed");
            }
        }
        self.expire(id);
    }
}

fn start_filter_process(command: &str) -> io::Result<()> {
    tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .spawn()
        .map(|_child| ())
}
