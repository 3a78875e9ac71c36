//! Verification, admission and identity rotation as seen from the wire.

mod common;

use std::sync::Arc;

use common::{
    create_temp_dir, create_test_file, next_event, random_bytes, start_share, test_config, within,
};

use wisp_core::code::{EndpointId, ShareCode};
use wisp_core::file::Destination;
use wisp_core::protocol::{read_frame, write_encoded, write_frame, Frame, FrameType, Message};
use wisp_core::security::PasswordGate;
use wisp_core::session::{ConnectOutcome, ReceiveEvent, ReceiveSession, ShareEvent};
use wisp_core::transport::{BoxedStream, MemoryTransport, Transport};
use wisp_core::Error;

async fn raw_channel(
    transport: &MemoryTransport,
    remote: &EndpointId,
    local: &EndpointId,
) -> BoxedStream {
    transport.dial(local, remote).await.expect("dial")
}

async fn send(stream: &mut BoxedStream, message: Message) {
    write_frame(stream, &Frame::Control(message))
        .await
        .expect("write");
}

async fn recv(stream: &mut BoxedStream) -> Message {
    match within(read_frame(stream)).await.expect("read") {
        Frame::Control(message) => message,
        other => panic!("unexpected frame {other:?}"),
    }
}

fn handshake() -> Message {
    Message::Handshake {
        version: wisp_core::PROTOCOL_VERSION.to_string(),
    }
}

#[tokio::test]
async fn test_wrong_passwords_keep_channel_open() {
    let dir = create_temp_dir();
    let source = create_test_file(dir.path(), "secret.txt", b"top secret");

    let transport = MemoryTransport::new();
    let mut config = test_config(1024, 1, &dir.path().join("state"));
    config.password = PasswordGate::with_password("hunter22");
    let share = start_share(&transport, config, &[source]).await;
    let snapshot = share.snapshot().await.expect("snapshot");

    let me = EndpointId::ephemeral();
    let mut stream = raw_channel(&transport, &snapshot.endpoint, &me).await;

    send(&mut stream, handshake()).await;
    assert_eq!(recv(&mut stream).await, Message::AuthRequired);

    for _ in 0..3 {
        send(
            &mut stream,
            Message::Auth {
                password: "guess".to_string(),
            },
        )
        .await;
        assert_eq!(recv(&mut stream).await, Message::AuthError);
    }

    send(
        &mut stream,
        Message::Auth {
            password: "hunter22".to_string(),
        },
    )
    .await;
    assert_eq!(recv(&mut stream).await, Message::HandshakeOk);

    send(&mut stream, Message::GetMetadata).await;
    match recv(&mut stream).await {
        Message::MetadataList { files } => {
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].name, "secret.txt");
        }
        other => panic!("expected catalog, got {other:?}"),
    }

    let snapshot = share.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.channels, 1);
    assert_eq!(snapshot.recent_failures, 3);
    assert_eq!(snapshot.code, snapshot.files[0].code, "no rotation below the threshold");

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_password_flow_through_sessions() {
    let dir = create_temp_dir();
    let content = random_bytes(9000);
    let source = create_test_file(dir.path(), "locked.bin", &content);

    let transport = MemoryTransport::new();
    let base = test_config(1024, 3, &dir.path().join("state"));
    let mut config = base.clone();
    config.password = PasswordGate::with_password("opensesame");
    let share = start_share(&transport, config, &[source]).await;
    let code = share.snapshot().await.expect("snapshot").code;

    let receive = ReceiveSession::start(Arc::new(transport.clone()), base);
    let outcome = within(receive.connect(&code)).await.expect("connect");
    assert_eq!(outcome, ConnectOutcome::PasswordRequired);

    for _ in 0..3 {
        let err = within(receive.submit_password("nope"))
            .await
            .expect_err("wrong password");
        assert!(matches!(err, Error::AuthFailed));
    }

    let catalog = within(receive.submit_password("opensesame"))
        .await
        .expect("right password");
    assert_eq!(catalog.len(), 1);
    assert_eq!(share.snapshot().await.expect("snapshot").channels, 3);

    let done = within(receive.download(&catalog[0].id, Destination::Memory))
        .await
        .expect("download");
    assert_eq!(done.bytes.expect("bytes"), content);

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_connect_with_password_skips_prompt() {
    let dir = create_temp_dir();
    let source = create_test_file(dir.path(), "a.txt", b"a");

    let transport = MemoryTransport::new();
    let base = test_config(1024, 2, &dir.path().join("state"));
    let mut config = base.clone();
    config.password = PasswordGate::with_password("pw");
    let share = start_share(&transport, config, &[source]).await;
    let code = share.snapshot().await.expect("snapshot").code;

    let receive = ReceiveSession::start(Arc::new(transport.clone()), base);
    let err = within(receive.connect_with_password(&code, "wrong"))
        .await
        .expect_err("wrong password");
    assert!(matches!(err, Error::AuthFailed));

    let outcome = within(receive.connect_with_password(&code, "pw"))
        .await
        .expect("connect");
    assert!(matches!(outcome, ConnectOutcome::Ready(files) if files.len() == 1));

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_message_before_verification_closes_channel() {
    let dir = create_temp_dir();
    let source = create_test_file(dir.path(), "a.txt", b"a");

    let transport = MemoryTransport::new();
    let config = test_config(1024, 2, &dir.path().join("state"));
    let share = start_share(&transport, config, &[source]).await;
    let endpoint = share.snapshot().await.expect("snapshot").endpoint;
    let mut events = share.subscribe();

    let me = EndpointId::ephemeral();
    let mut stream = raw_channel(&transport, &endpoint, &me).await;
    send(&mut stream, Message::GetMetadata).await;

    let reason = next_event(&mut events, |event| match event {
        ShareEvent::ProtocolViolation { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert!(reason.contains("get_metadata"));

    // Closed without a reply; nothing sent afterwards is processed.
    assert!(within(read_frame(&mut stream)).await.is_err());

    let snapshot = share.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.channels, 0);
    assert_eq!(snapshot.recent_failures, 1);

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_chunk_before_verification_is_a_violation() {
    let dir = create_temp_dir();
    let source = create_test_file(dir.path(), "a.txt", b"a");

    let transport = MemoryTransport::new();
    let config = test_config(1024, 2, &dir.path().join("state"));
    let share = start_share(&transport, config, &[source]).await;
    let endpoint = share.snapshot().await.expect("snapshot").endpoint;
    let mut events = share.subscribe();

    let mut stream = raw_channel(&transport, &endpoint, &EndpointId::ephemeral()).await;
    write_frame(
        &mut stream,
        &Frame::Chunk {
            index: 0,
            data: vec![1, 2, 3],
        },
    )
    .await
    .expect("write");

    next_event(&mut events, |event| match event {
        ShareEvent::ProtocolViolation { .. } => Some(()),
        _ => None,
    })
    .await;
    assert!(within(read_frame(&mut stream)).await.is_err());

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_channels_above_cap_are_refused() {
    let dir = create_temp_dir();
    let source = create_test_file(dir.path(), "a.txt", b"a");

    let transport = MemoryTransport::new();
    // Two channels plus the default slack of two: the fifth is one too many.
    let config = test_config(1024, 2, &dir.path().join("state"));
    let share = start_share(&transport, config, &[source]).await;
    let endpoint = share.snapshot().await.expect("snapshot").endpoint;
    let me = EndpointId::ephemeral();

    let mut admitted = Vec::new();
    for _ in 0..4 {
        let mut stream = raw_channel(&transport, &endpoint, &me).await;
        send(&mut stream, handshake()).await;
        assert_eq!(recv(&mut stream).await, Message::HandshakeOk);
        admitted.push(stream);
    }

    let mut extra = raw_channel(&transport, &endpoint, &me).await;
    match recv(&mut extra).await {
        Message::Rejected { reason } => assert_eq!(reason, "connection limit reached"),
        other => panic!("expected rejection, got {other:?}"),
    }

    let snapshot = share.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.channels, 4);
    assert_eq!(snapshot.recent_failures, 0, "cap rejections are not failures");

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_locked_room_refuses_second_peer() {
    let dir = create_temp_dir();
    let content = random_bytes(200 * 1024);
    let source = create_test_file(dir.path(), "one.bin", &content);

    let transport = MemoryTransport::new();
    let config = test_config(4096, 3, &dir.path().join("state"));
    let share = start_share(&transport, config.clone(), &[source]).await;
    let code = share.snapshot().await.expect("snapshot").code;

    let first = ReceiveSession::start(Arc::new(transport.clone()), config.clone());
    let catalog = match within(first.connect(&code)).await.expect("first connect") {
        ConnectOutcome::Ready(files) => files,
        ConnectOutcome::PasswordRequired => panic!("no password set"),
    };

    share.lock_room().await.expect("lock");

    let second = ReceiveSession::start(Arc::new(transport.clone()), config);
    let mut second_events = second.subscribe();
    let err = within(second.connect(&code))
        .await
        .expect_err("room is locked");
    assert!(
        matches!(err, Error::ConnectionRejected(_) | Error::ConnectionLost(_)),
        "unexpected error {err:?}"
    );
    let reason = next_event(&mut second_events, |event| match event {
        ReceiveEvent::Rejected { reason } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, "room is locked");

    let snapshot = share.snapshot().await.expect("snapshot");
    assert!(snapshot.locked);
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.channels, 3);

    let done = within(first.download(&catalog[0].id, Destination::Memory))
        .await
        .expect("first peer unaffected");
    assert_eq!(done.bytes.expect("bytes"), content);

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_lock_on_transfer() {
    let dir = create_temp_dir();
    let source = create_test_file(dir.path(), "a.bin", &random_bytes(4000));

    let transport = MemoryTransport::new();
    let mut config = test_config(1024, 2, &dir.path().join("state"));
    config.lock_on_transfer = true;
    let share = start_share(&transport, config.clone(), &[source]).await;
    let code = share.snapshot().await.expect("snapshot").code;
    let mut events = share.subscribe();

    let receive = ReceiveSession::start(Arc::new(transport.clone()), config);
    let catalog = match within(receive.connect(&code)).await.expect("connect") {
        ConnectOutcome::Ready(files) => files,
        ConnectOutcome::PasswordRequired => panic!("no password set"),
    };
    assert!(!share.snapshot().await.expect("snapshot").locked);

    within(receive.download(&catalog[0].id, Destination::Memory))
        .await
        .expect("download");

    next_event(&mut events, |event| (event == ShareEvent::RoomLocked).then_some(())).await;
    assert!(share.snapshot().await.expect("snapshot").locked);

    share.unlock_room().await.expect("unlock");
    assert!(!share.snapshot().await.expect("snapshot").locked);

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_failures_rotate_identity() {
    let dir = create_temp_dir();
    let source = create_test_file(dir.path(), "a.txt", b"a");

    let transport = MemoryTransport::new();
    let mut config = test_config(1024, 1, &dir.path().join("state"));
    config.password = PasswordGate::with_password("correct horse");
    let share = start_share(&transport, config.clone(), &[source]).await;
    let before = share.snapshot().await.expect("snapshot");
    let mut events = share.subscribe();

    let mut stream = raw_channel(&transport, &before.endpoint, &EndpointId::ephemeral()).await;
    send(&mut stream, handshake()).await;
    assert_eq!(recv(&mut stream).await, Message::AuthRequired);

    for attempt in 0..config.failure_threshold {
        send(
            &mut stream,
            Message::Auth {
                password: format!("guess {attempt}"),
            },
        )
        .await;
    }

    let (previous, code) = next_event(&mut events, |event| match event {
        ShareEvent::IdentityRotated { previous, code, .. } => Some((previous, code)),
        _ => None,
    })
    .await;
    assert_eq!(previous, before.code);
    assert_ne!(code, before.code);

    let after = share.snapshot().await.expect("snapshot");
    assert_eq!(after.code, code);
    assert_eq!(after.recent_failures, 0);
    assert_eq!(after.channels, 0);
    assert_eq!(after.files[0].code, code);
    assert!(after.files[0].url.ends_with(code.as_str()));
    assert!(!transport.is_registered(&before.endpoint));
    assert!(transport.is_registered(&after.endpoint));

    let receive = ReceiveSession::start(
        Arc::new(transport.clone()),
        test_config(1024, 1, &dir.path().join("rx")),
    );
    let err = within(receive.connect(&before.code))
        .await
        .expect_err("old code is gone");
    assert!(matches!(err, Error::PeerUnavailable(_)));

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_undecodable_frames_before_verification_rotate_identity() {
    let dir = create_temp_dir();
    let transport = MemoryTransport::new();
    let config = test_config(1024, 1, &dir.path().join("state"));
    let share = start_share(&transport, config.clone(), &[]).await;
    let before = share.snapshot().await.expect("snapshot");
    let mut events = share.subscribe();

    // A numeric version does not decode as a handshake.
    let malformed = br#"{"type":"handshake","version":1}"#;
    for _ in 0..config.failure_threshold {
        let mut stream = raw_channel(&transport, &before.endpoint, &EndpointId::ephemeral()).await;
        write_encoded(&mut stream, FrameType::Control, malformed)
            .await
            .expect("write");
        next_event(&mut events, |event| match event {
            ShareEvent::ProtocolViolation { reason, .. } => Some(reason),
            _ => None,
        })
        .await;
    }

    let (previous, code) = next_event(&mut events, |event| match event {
        ShareEvent::IdentityRotated { previous, code, .. } => Some((previous, code)),
        _ => None,
    })
    .await;
    assert_eq!(previous, before.code);
    assert_ne!(code, before.code);
    assert!(!transport.is_registered(&before.endpoint));

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_undecodable_frame_after_verification_is_not_a_failure() {
    let dir = create_temp_dir();
    let source = create_test_file(dir.path(), "a.txt", b"a");
    let transport = MemoryTransport::new();
    let config = test_config(1024, 1, &dir.path().join("state"));
    let share = start_share(&transport, config, &[source]).await;
    let snapshot = share.snapshot().await.expect("snapshot");

    let mut stream = raw_channel(&transport, &snapshot.endpoint, &EndpointId::ephemeral()).await;
    send(&mut stream, handshake()).await;
    assert_eq!(recv(&mut stream).await, Message::HandshakeOk);

    write_encoded(&mut stream, FrameType::Control, b"{not json")
        .await
        .expect("write");
    drop(stream);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let after = share.snapshot().await.expect("snapshot");
    assert_eq!(after.recent_failures, 0);
    assert_eq!(after.code, snapshot.code);

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_manual_rotation() {
    let dir = create_temp_dir();
    let transport = MemoryTransport::new();
    let config = test_config(1024, 1, &dir.path().join("state"));
    let share = start_share(&transport, config, &[]).await;
    let before = share.snapshot().await.expect("snapshot");

    let code = share.rotate().await.expect("rotate");
    assert_ne!(code, before.code);
    assert!(!transport.is_registered(&before.endpoint));
    assert!(transport.is_registered(&EndpointId::for_code(&code)));

    share.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_unreachable_codes_require_human_check() {
    let dir = create_temp_dir();
    let transport = MemoryTransport::new();
    let receive = ReceiveSession::start(
        Arc::new(transport),
        test_config(1024, 2, &dir.path().join("state")),
    );
    let mut events = receive.subscribe();

    for code in ["111111", "222222", "333333"] {
        let err = within(receive.connect(&ShareCode::parse(code).expect("code")))
            .await
            .expect_err("nobody home");
        assert!(matches!(err, Error::PeerUnavailable(_)));
    }

    let question = next_event(&mut events, |event| match event {
        ReceiveEvent::HumanCheckRequired { question } => Some(question),
        _ => None,
    })
    .await;

    let code = ShareCode::parse("444444").expect("code");
    let err = within(receive.connect(&code))
        .await
        .expect_err("challenge pending");
    assert!(matches!(err, Error::HumanCheckRequired));
    assert_eq!(
        receive.human_challenge().await.expect("challenge"),
        Some(question.clone())
    );

    let wrong = answer(&question) + 1;
    assert!(!receive
        .solve_human_check(&wrong.to_string())
        .await
        .expect("solve"));

    let question = receive
        .human_challenge()
        .await
        .expect("challenge")
        .expect("new question after a wrong answer");
    assert!(receive
        .solve_human_check(&answer(&question).to_string())
        .await
        .expect("solve"));
    assert_eq!(receive.human_challenge().await.expect("challenge"), None);

    let err = within(receive.connect(&code))
        .await
        .expect_err("still nobody home");
    assert!(matches!(err, Error::PeerUnavailable(_)));
}

fn answer(question: &str) -> u32 {
    question
        .split('+')
        .map(|term| term.trim().parse::<u32>().expect("operand"))
        .sum()
}
