//! Scripted in-memory backend filters to exercise the multiplexer against

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::compat::TokioAsyncReadCompatExt;

use muxtr::backend::{Backend, BoxedIo, Connector, QueueConnector, Timeouts};
use muxtr::spool::{BodySpool, MemSpool};
use muxtr::{Children, ChildrenConfig};
use muxtr_proto::mods::Modification;
use muxtr_proto::optneg::OptNeg;
use muxtr_proto::replies::{
    Accept, Continue, Discard, Reject, Reply, Replycode, Skip, TemporaryFailure,
};
use muxtr_proto::wire::{MtaCommand, Writable};

/// How a scripted filter answers one stage
#[derive(Debug, Clone)]
pub enum Answer {
    Continue,
    Accept,
    Reject,
    TemporaryFailure,
    Discard,
    Skip,
    ReplyCode(u16, &'static str, &'static str),
    /// Never answer; the session should run into its read deadline
    Silent,
}

/// What one scripted filter announces and how it behaves, stage by stage
#[derive(Debug, Clone)]
pub struct Script {
    pub options: OptNeg,
    pub connect: Answer,
    pub helo: Answer,
    pub mail: Answer,
    pub rcpt: Answer,
    pub data: Answer,
    pub header: Answer,
    pub end_of_header: Answer,
    pub body: Answer,
    pub end_of_message: Answer,
    /// Modifications written right before the end-of-message answer
    pub mods: Vec<Modification>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            options: OptNeg::default(),
            connect: Answer::Continue,
            helo: Answer::Continue,
            mail: Answer::Continue,
            rcpt: Answer::Continue,
            data: Answer::Continue,
            header: Answer::Continue,
            end_of_header: Answer::Continue,
            body: Answer::Continue,
            end_of_message: Answer::Continue,
            mods: Vec::new(),
        }
    }
}

/// Everything a scripted filter observed, for asserting on afterwards
#[derive(Debug, Default)]
pub struct Transcript {
    /// Command names in arrival order
    pub commands: Vec<&'static str>,
    /// All body bytes received, concatenated in order
    pub body: Vec<u8>,
}

impl Transcript {
    pub fn saw(&self, command: &str) -> bool {
        self.commands.iter().any(|&seen| seen == command)
    }
}

async fn read_frame(io: &mut DuplexStream) -> Option<BytesMut> {
    let mut length = [0u8; 4];
    io.read_exact(&mut length).await.ok()?;
    let length = u32::from_be_bytes(length) as usize;

    let mut payload = vec![0u8; length];
    io.read_exact(&mut payload).await.ok()?;
    Some(BytesMut::from(&payload[..]))
}

async fn write_item<W: Writable>(io: &mut DuplexStream, item: &W) {
    let mut frame = BytesMut::new();
    frame.put_u32(item.len() as u32 + 1);
    frame.put_u8(item.code());
    item.write(&mut frame);
    io.write_all(&frame).await.expect("filter write");
}

async fn write_answer(io: &mut DuplexStream, answer: &Answer) {
    match answer {
        Answer::Continue => write_item(io, &Reply::Continue(Continue)).await,
        Answer::Accept => write_item(io, &Reply::Accept(Accept)).await,
        Answer::Reject => write_item(io, &Reply::Reject(Reject)).await,
        Answer::TemporaryFailure => {
            write_item(io, &Reply::TemporaryFailure(TemporaryFailure)).await;
        }
        Answer::Discard => write_item(io, &Reply::Discard(Discard)).await,
        Answer::Skip => write_item(io, &Reply::Skip(Skip)).await,
        Answer::ReplyCode(code, xcode, message) => {
            write_item(io, &Reply::Replycode(Replycode::new(*code, xcode, message))).await;
        }
        Answer::Silent => {}
    }
}

/// Run a filter following `script` on one end of a duplex pipe
pub fn spawn_filter(mut io: DuplexStream, script: Script) -> JoinHandle<Transcript> {
    tokio::spawn(async move {
        let mut transcript = Transcript::default();

        while let Some(frame) = read_frame(&mut io).await {
            let command = MtaCommand::parse(frame).expect("well-formed command frame");
            match command {
                MtaCommand::OptNeg(_offer) => {
                    transcript.commands.push("optneg");
                    write_item(&mut io, &script.options).await;
                }
                MtaCommand::Connect(_) => {
                    transcript.commands.push("connect");
                    write_answer(&mut io, &script.connect).await;
                }
                MtaCommand::Helo(_) => {
                    transcript.commands.push("helo");
                    write_answer(&mut io, &script.helo).await;
                }
                MtaCommand::Mail(_) => {
                    transcript.commands.push("mail");
                    write_answer(&mut io, &script.mail).await;
                }
                MtaCommand::Recipient(_) => {
                    transcript.commands.push("rcpt");
                    write_answer(&mut io, &script.rcpt).await;
                }
                MtaCommand::Data(_) => {
                    transcript.commands.push("data");
                    write_answer(&mut io, &script.data).await;
                }
                MtaCommand::Header(_) => {
                    transcript.commands.push("header");
                    write_answer(&mut io, &script.header).await;
                }
                MtaCommand::EndOfHeader(_) => {
                    transcript.commands.push("eoh");
                    write_answer(&mut io, &script.end_of_header).await;
                }
                MtaCommand::Body(body) => {
                    transcript.commands.push("body");
                    transcript.body.extend_from_slice(body.as_bytes());
                    write_answer(&mut io, &script.body).await;
                }
                MtaCommand::EndOfMessage(end) => {
                    transcript.commands.push("eom");
                    transcript.body.extend_from_slice(end.as_bytes());
                    for modification in &script.mods {
                        write_item(&mut io, modification).await;
                    }
                    write_answer(&mut io, &script.end_of_message).await;
                }
                MtaCommand::Macro(_) => {
                    transcript.commands.push("macro");
                }
                MtaCommand::Unknown(_) => {
                    transcript.commands.push("unknown");
                }
                MtaCommand::Abort(_) => {
                    transcript.commands.push("abort");
                    // The aborted message is gone, body included
                    transcript.body.clear();
                }
                MtaCommand::Quit(_) | MtaCommand::QuitNc(_) => {
                    transcript.commands.push("quit");
                    break;
                }
            }
        }

        transcript
    })
}

/// A connector that refuses a configured number of attempts per backend
/// before delegating to the queued transports
pub struct FlakyConnector {
    inner: QueueConnector,
    refusals: Mutex<HashMap<String, usize>>,
}

impl FlakyConnector {
    pub fn new(inner: QueueConnector, refusals: &[(&str, usize)]) -> Self {
        Self {
            inner,
            refusals: Mutex::new(
                refusals
                    .iter()
                    .map(|(name, count)| ((*name).to_string(), *count))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn open(&self, backend: &Backend) -> io::Result<BoxedIo> {
        {
            let mut refusals = self.refusals.lock().expect("refusal lock");
            if let Some(left) = refusals.get_mut(&backend.name) {
                if *left > 0 {
                    *left -= 1;
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "scripted refusal",
                    ));
                }
            }
        }
        self.inner.open(backend).await
    }
}

/// A [`Children`] wired to scripted filters over in-memory pipes
pub struct Rig {
    pub children: Children,
    pub filters: Vec<JoinHandle<Transcript>>,
}

pub fn test_timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_millis(500),
        write: Duration::from_millis(500),
        read: Duration::from_millis(500),
        end_of_message: Duration::from_millis(500),
    }
}

pub fn test_config() -> ChildrenConfig {
    ChildrenConfig {
        retry_connect_delay: Duration::from_millis(50),
        ..ChildrenConfig::default()
    }
}

/// Build a rig with one backend per script, named `filter-0`, `filter-1`, …
pub fn rig(scripts: Vec<Script>) -> Rig {
    let connector = QueueConnector::new();
    let mut filters = Vec::new();
    let mut backends = Vec::new();

    for (index, script) in scripts.into_iter().enumerate() {
        let name = format!("filter-{index}");
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        connector.register(&name, Box::new(ours.compat()));
        filters.push(spawn_filter(theirs, script));
        backends.push(Backend::tcp(&name, "127.0.0.1:0").with_timeouts(test_timeouts()));
    }

    let children = Children::new(backends, test_config())
        .with_connector(Arc::new(connector))
        .with_spool_factory(|| Ok(Box::new(MemSpool::new()) as Box<dyn BodySpool>));

    Rig { children, filters }
}
