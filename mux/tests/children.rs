//! End-to-end runs of the multiplexer against scripted backend filters

mod support;

use pretty_assertions::assert_eq;

use muxtr::{CollectSink, Event};
use muxtr_proto::commands::{Connect, EndOfMessage, Family, Header, Helo, Macro, Mail, Recipient};
use muxtr_proto::mods::{AddHeader, Modification, Quarantine, ReplaceBody};
use muxtr_proto::optneg::{Capability, OptNeg, Protocol};

use support::{rig, Answer, Script};

fn kinds(events: &[Event]) -> Vec<&'static str> {
    events
        .iter()
        .map(|event| match event {
            Event::NegotiateReply(_) => "negotiate-reply",
            Event::Continue => "continue",
            Event::Reject => "reject",
            Event::TemporaryFailure => "temporary-failure",
            Event::Accept => "accept",
            Event::Discard => "discard",
            Event::Skip => "skip",
            Event::Progress => "progress",
            Event::Quarantine(_) => "quarantine",
            Event::ReplyCode(_) => "reply-code",
            Event::AddHeader(_) => "add-header",
            Event::InsertHeader(_) => "insert-header",
            Event::ChangeHeader(_) => "change-header",
            Event::ChangeFrom(_) => "change-from",
            Event::AddRecipient(_) => "add-recipient",
            Event::AddRecipientPar(_) => "add-recipient",
            Event::DeleteRecipient(_) => "delete-recipient",
            Event::ReplaceBody(_) => "replace-body",
            Event::Shutdown => "shutdown",
            Event::ConnectionFailure => "connection-failure",
            Event::Finished => "finished",
            Event::Error { .. } => "error",
        })
        .collect()
}

fn sample_connect() -> Connect {
    Connect::new(b"client.example", Family::Inet, Some(2525), b"192.0.2.7")
}

#[tokio::test]
async fn normal_path_two_backends() {
    let mut rig = rig(vec![Script::default(), Script::default()]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children
        .macro_forward(Macro::new(b'C', &[(b"j", b"mx.example")]), &mut sink)
        .await
        .expect("macro");
    rig.children
        .connect(sample_connect(), &mut sink)
        .await
        .expect("connect");
    rig.children
        .helo(Helo::from(b"client.example".as_slice()), &mut sink)
        .await
        .expect("helo");
    rig.children
        .envelope_from(Mail::from(b"<sender@example>".as_slice()), &mut sink)
        .await
        .expect("mail");
    rig.children
        .envelope_recipient(Recipient::from(b"<rcpt@example>".as_slice()), &mut sink)
        .await
        .expect("rcpt");
    rig.children.data(&mut sink).await.expect("data");
    rig.children
        .header(Header::new(b"From", b"sender@example"), &mut sink)
        .await
        .expect("header");
    rig.children
        .header(Header::new(b"Subject", b"hello"), &mut sink)
        .await
        .expect("header");
    rig.children.end_of_header(&mut sink).await.expect("eoh");
    rig.children
        .body(b"the body bytes".as_slice().into(), &mut sink)
        .await
        .expect("body");
    rig.children
        .end_of_message(EndOfMessage::default(), &mut sink)
        .await
        .expect("eom");
    rig.children.quit(&mut sink).await.expect("quit");

    assert_eq!(
        kinds(&sink.events),
        vec![
            "negotiate-reply",
            "continue", // connect
            "continue", // helo
            "continue", // mail
            "continue", // rcpt
            "continue", // data
            "continue", // header
            "continue", // header
            "continue", // end of header
            "continue", // body chunk
            "continue", // end of message
            "finished",
        ]
    );

    // Both filters saw the full conversation and the exact body bytes
    for filter in rig.filters {
        let transcript = filter.await.expect("filter task");
        for expected in ["optneg", "macro", "connect", "helo", "mail", "rcpt", "data", "eoh", "body", "eom", "quit"] {
            assert!(
                transcript.saw(expected),
                "missing {expected} in {:?}",
                transcript.commands
            );
        }
        assert_eq!(transcript.body, b"the body bytes");
    }
}

#[tokio::test]
async fn reject_at_recipient_keeps_the_session() {
    let mut rig = rig(vec![
        Script::default(),
        Script {
            rcpt: Answer::Reject,
            ..Script::default()
        },
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children
        .envelope_recipient(Recipient::from(b"<one@example>".as_slice()), &mut sink)
        .await
        .expect("rcpt");

    assert_eq!(kinds(&sink.events), vec!["negotiate-reply", "reject"]);
    // Recipient-scope rejection must not tear the message down
    assert_eq!(rig.children.live_backends(), 2);

    // The conversation proceeds; the next stage still aggregates
    rig.children.data(&mut sink).await.expect("data");
    assert_eq!(kinds(&sink.events).last(), Some(&"continue"));
}

#[tokio::test]
async fn reject_at_mail_tears_down() {
    let mut rig = rig(vec![
        Script::default(),
        Script {
            mail: Answer::Reject,
            ..Script::default()
        },
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children
        .envelope_from(Mail::from(b"<sender@example>".as_slice()), &mut sink)
        .await
        .expect("mail");

    assert_eq!(
        kinds(&sink.events),
        vec!["negotiate-reply", "reject", "finished"]
    );
    assert_eq!(rig.children.live_backends(), 0);
}

#[tokio::test]
async fn skip_stops_body_chunks_to_that_backend() {
    let mut rig = rig(vec![
        Script {
            body: Answer::Skip,
            ..Script::default()
        },
        Script::default(),
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children.end_of_header(&mut sink).await.expect("eoh");
    rig.children
        .body(b"chunk one ".as_slice().into(), &mut sink)
        .await
        .expect("body");
    let events_after_first_chunk = sink.events.len();
    rig.children
        .body(b"chunk two".as_slice().into(), &mut sink)
        .await
        .expect("body");
    // The skipping leader got no second chunk, so there was nothing to ack
    assert_eq!(sink.events.len(), events_after_first_chunk);

    rig.children
        .end_of_message(EndOfMessage::default(), &mut sink)
        .await
        .expect("eom");
    rig.children.quit(&mut sink).await.expect("quit");

    assert_eq!(kinds(&sink.events).last(), Some(&"finished"));
    assert_eq!(
        kinds(&sink.events)
            .iter()
            .filter(|&&kind| kind == "continue")
            .count(),
        3 // end of header, first chunk, end of message
    );

    let skipper = rig.filters.remove(0).await.expect("filter task");
    assert_eq!(skipper.body, b"chunk one ");
    let follower = rig.filters.remove(0).await.expect("filter task");
    assert_eq!(follower.body, b"chunk one chunk two");
}

#[tokio::test]
async fn discard_beats_reject_at_recipient() {
    let mut rig = rig(vec![
        Script {
            rcpt: Answer::Reject,
            ..Script::default()
        },
        Script {
            rcpt: Answer::Discard,
            ..Script::default()
        },
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children
        .envelope_recipient(Recipient::from(b"<one@example>".as_slice()), &mut sink)
        .await
        .expect("rcpt");

    assert_eq!(
        kinds(&sink.events),
        vec!["negotiate-reply", "discard", "finished"]
    );
    assert_eq!(rig.children.live_backends(), 0);
}

#[tokio::test]
async fn connect_retry_succeeds_without_surfaced_error() {
    use std::sync::Arc;

    use muxtr::backend::{Backend, QueueConnector};
    use muxtr::spool::{BodySpool, MemSpool};
    use muxtr::Children;
    use support::{spawn_filter, test_config, test_timeouts, FlakyConnector};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    let queue = QueueConnector::new();
    let (ours, theirs) = tokio::io::duplex(1 << 16);
    queue.register("filter-0", Box::new(ours.compat()));
    let filter = spawn_filter(theirs, Script::default());

    let connector = FlakyConnector::new(queue, &[("filter-0", 1)]);
    let mut children = Children::new(
        vec![Backend::tcp("filter-0", "127.0.0.1:0").with_timeouts(test_timeouts())],
        test_config(),
    )
    .with_connector(Arc::new(connector))
    .with_spool_factory(|| Ok(Box::new(MemSpool::new()) as Box<dyn BodySpool>));

    let mut sink = CollectSink::new();
    children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");

    assert_eq!(kinds(&sink.events), vec!["negotiate-reply"]);
    assert_eq!(children.live_backends(), 1);

    children.quit(&mut sink).await.expect("quit");
    filter.await.expect("filter task");
}

#[tokio::test]
async fn timeout_counts_like_an_absent_backend() {
    let mut rig = rig(vec![
        Script {
            helo: Answer::Silent,
            ..Script::default()
        },
        Script::default(),
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children
        .helo(Helo::from(b"client.example".as_slice()), &mut sink)
        .await
        .expect("helo");

    let kinds = kinds(&sink.events);
    assert!(kinds.contains(&"error"), "timeout must surface an error");
    assert_eq!(kinds.last(), Some(&"continue"));
    assert_eq!(rig.children.live_backends(), 1);
}

#[tokio::test]
async fn step_flags_exclude_backends_from_stages() {
    let mut rig = rig(vec![
        Script {
            options: OptNeg {
                protocol: Protocol::NO_HELO,
                ..OptNeg::default()
            },
            ..Script::default()
        },
        Script::default(),
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");

    // One backend objecting to helo is not enough to drop the stage
    let merged = rig.children.merged_option().expect("negotiated").clone();
    assert!(!merged.protocol.contains(Protocol::NO_HELO));

    rig.children
        .helo(Helo::from(b"client.example".as_slice()), &mut sink)
        .await
        .expect("helo");
    rig.children.quit(&mut sink).await.expect("quit");

    let abstainer = rig.filters.remove(0).await.expect("filter task");
    assert!(!abstainer.saw("helo"), "no-helo filter must not see helo");
    let participant = rig.filters.remove(0).await.expect("filter task");
    assert!(participant.saw("helo"));
}

#[tokio::test]
async fn negotiate_merges_actions_and_steps() {
    let mut rig = rig(vec![
        Script {
            options: OptNeg {
                capabilities: Capability::ADD_HEADERS,
                protocol: Protocol::NO_BODY | Protocol::NO_HELO,
                ..OptNeg::default()
            },
            ..Script::default()
        },
        Script {
            options: OptNeg {
                capabilities: Capability::CHANGE_BODY,
                protocol: Protocol::NO_HELO,
                ..OptNeg::default()
            },
            ..Script::default()
        },
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");

    let Some(Event::NegotiateReply(merged)) = sink.events.first() else {
        panic!("expected a negotiate reply, got {:?}", sink.events);
    };
    // Action flags union, step flags intersect
    assert_eq!(
        merged.capabilities,
        Capability::ADD_HEADERS | Capability::CHANGE_BODY
    );
    assert_eq!(merged.protocol, Protocol::NO_HELO);
}

#[tokio::test]
async fn modifications_are_merged_and_replacement_streamed() {
    let mut rig = rig(vec![
        Script::default(),
        Script {
            mods: vec![
                Modification::AddHeader(AddHeader::new(b"X-Scanned", b"yes")),
                Modification::ReplaceBody(ReplaceBody::new(b"a fresh body\r\n")),
            ],
            ..Script::default()
        },
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children.end_of_header(&mut sink).await.expect("eoh");
    rig.children
        .body(b"original body".as_slice().into(), &mut sink)
        .await
        .expect("body");
    rig.children
        .end_of_message(EndOfMessage::default(), &mut sink)
        .await
        .expect("eom");

    let kinds = kinds(&sink.events);
    assert!(kinds.contains(&"add-header"));
    assert!(kinds.contains(&"replace-body"));
    assert_eq!(kinds.last(), Some(&"continue"));

    // The streamed replacement is exactly what the backend sent
    let replacement: Vec<u8> = sink
        .events
        .iter()
        .filter_map(|event| match event {
            Event::ReplaceBody(chunk) => Some(chunk.to_vec()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(replacement, b"a fresh body\r\n");
}

#[tokio::test]
async fn discard_at_end_of_message_suppresses_later_modifications() {
    let mut rig = rig(vec![
        Script {
            end_of_message: Answer::Discard,
            ..Script::default()
        },
        Script {
            mods: vec![Modification::AddHeader(AddHeader::new(b"X-Late", b"no"))],
            ..Script::default()
        },
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children.end_of_header(&mut sink).await.expect("eoh");
    rig.children
        .end_of_message(EndOfMessage::from(b"tiny".as_slice()), &mut sink)
        .await
        .expect("eom");

    let kinds = kinds(&sink.events);
    assert!(kinds.contains(&"discard"));
    assert!(
        !kinds.contains(&"add-header"),
        "no modifications may follow a discard teardown"
    );
    assert_eq!(rig.children.live_backends(), 0);
}

#[tokio::test]
async fn reply_code_wins_the_stage_verdict() {
    let mut rig = rig(vec![
        Script::default(),
        Script {
            rcpt: Answer::ReplyCode(550, "5.7.1", "not today"),
            ..Script::default()
        },
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children
        .envelope_recipient(Recipient::from(b"<one@example>".as_slice()), &mut sink)
        .await
        .expect("rcpt");

    let Some(Event::ReplyCode(code)) = sink.events.last() else {
        panic!("expected a reply-code event, got {:?}", sink.events);
    };
    assert_eq!(code.smtp_code(), 550);
    assert_eq!(code.xcode(), "5.7.1");
    // Recipient scope: the rejecting session stays
    assert_eq!(rig.children.live_backends(), 2);
}

#[tokio::test]
async fn quarantine_is_forwarded_from_end_of_message() {
    let mut rig = rig(vec![Script {
        mods: vec![Modification::Quarantine(Quarantine::new(b"looks off"))],
        ..Script::default()
    }]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children.end_of_header(&mut sink).await.expect("eoh");
    rig.children
        .end_of_message(EndOfMessage::default(), &mut sink)
        .await
        .expect("eom");

    let quarantined = sink.events.iter().any(|event| {
        matches!(event, Event::Quarantine(reason) if reason.reason() == "looks off")
    });
    assert!(quarantined, "missing quarantine in {:?}", sink.events);
}

#[tokio::test]
async fn abort_resets_the_message_but_keeps_sessions() {
    let mut rig = rig(vec![Script::default(), Script::default()]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");
    rig.children
        .envelope_from(Mail::from(b"<sender@example>".as_slice()), &mut sink)
        .await
        .expect("mail");
    rig.children.end_of_header(&mut sink).await.expect("eoh");
    rig.children
        .body(b"dropped with the message".as_slice().into(), &mut sink)
        .await
        .expect("body");
    rig.children.abort(&mut sink).await.expect("abort");

    assert_eq!(rig.children.live_backends(), 2);

    // A second message flows through the same sessions; the aborted body
    // must not leak into it
    rig.children
        .envelope_from(Mail::from(b"<other@example>".as_slice()), &mut sink)
        .await
        .expect("mail");
    rig.children.end_of_header(&mut sink).await.expect("eoh");
    rig.children
        .body(b"second message".as_slice().into(), &mut sink)
        .await
        .expect("body");
    rig.children
        .end_of_message(EndOfMessage::default(), &mut sink)
        .await
        .expect("eom");
    assert_eq!(kinds(&sink.events).last(), Some(&"continue"));

    rig.children.quit(&mut sink).await.expect("quit");
    for filter in rig.filters {
        let transcript = filter.await.expect("filter task");
        assert!(transcript.saw("abort"));
        assert_eq!(transcript.body, b"second message");
    }
}

#[tokio::test]
async fn newer_protocol_backend_is_dropped_at_negotiate() {
    let mut rig = rig(vec![
        Script {
            options: OptNeg {
                version: OptNeg::VERSION + 1,
                ..OptNeg::default()
            },
            ..Script::default()
        },
        Script::default(),
    ]);
    let mut sink = CollectSink::new();

    rig.children
        .negotiate(OptNeg::default(), &mut sink)
        .await
        .expect("negotiate");

    // The too-new backend is quit; the other one carries the message
    assert_eq!(kinds(&sink.events), vec!["negotiate-reply"]);
    assert_eq!(rig.children.live_backends(), 1);

    let Some(Event::NegotiateReply(merged)) = sink.events.first() else {
        panic!("expected a negotiate reply, got {:?}", sink.events);
    };
    assert_eq!(merged.version, OptNeg::VERSION);
}
