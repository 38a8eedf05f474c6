use std::time::Duration;

use resplex::{
    cmd, ConnectionEvent, ErrorKind, ManagedConnection, ReconnectConfig, ReplayPolicy,
    ReplyShape, Value,
};
use resplex_test::{expect_command, pipe, reply, QueueConnector};

fn fast_config() -> ReconnectConfig {
    ReconnectConfig::default()
        .delay_base(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
}

#[tokio::test]
async fn reconnects_and_emits_lifecycle_events() {
    let (local1, mut peer1) = pipe();
    let (local2, mut peer2) = pipe();
    let connector = QueueConnector::new([local1, local2]);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let conn = ManagedConnection::connect(connector, fast_config().event_listener(tx))
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Connected);

    let handle = conn.submit(&cmd("PING"), ReplyShape::Value).await.unwrap();
    expect_command(&mut peer1, &cmd("PING")).await;
    reply(&mut peer1, b"+PONG\r\n").await;
    assert_eq!(
        handle.wait().await.unwrap(),
        Value::SimpleString("PONG".into())
    );

    drop(peer1);
    assert!(matches!(
        rx.recv().await.unwrap(),
        ConnectionEvent::Disconnected(_)
    ));
    assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Reconnecting);
    assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Reconnected);

    let handle = conn.submit(&cmd("PING"), ReplyShape::Value).await.unwrap();
    expect_command(&mut peer2, &cmd("PING")).await;
    reply(&mut peer2, b"+PONG\r\n").await;
    assert_eq!(
        handle.wait().await.unwrap(),
        Value::SimpleString("PONG".into())
    );
}

#[tokio::test]
async fn written_commands_fail_under_the_default_policy() {
    let (local1, mut peer1) = pipe();
    let (local2, mut peer2) = pipe();
    let connector = QueueConnector::new([local1, local2]);

    let conn = ManagedConnection::connect(connector, fast_config())
        .await
        .unwrap();

    let handle = conn.submit(&cmd("INCR"), ReplyShape::Value).await.unwrap();
    expect_command(&mut peer1, &cmd("INCR")).await;
    drop(peer1);

    // the command reached the wire; resending might double-apply it
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);

    // the connection itself recovered
    let handle = conn.submit(&cmd("PING"), ReplyShape::Value).await.unwrap();
    expect_command(&mut peer2, &cmd("PING")).await;
    reply(&mut peer2, b"+PONG\r\n").await;
    assert!(handle.wait().await.is_ok());
}

#[tokio::test]
async fn retry_policy_replays_written_commands_on_the_new_transport() {
    let (local1, mut peer1) = pipe();
    let (local2, mut peer2) = pipe();
    let connector = QueueConnector::new([local1, local2]);

    let conn = ManagedConnection::connect(
        connector,
        fast_config().replay_policy(ReplayPolicy::RetryUnconfirmed),
    )
    .await
    .unwrap();

    let handle = conn.submit(&cmd("PING"), ReplyShape::Value).await.unwrap();
    expect_command(&mut peer1, &cmd("PING")).await;
    drop(peer1);

    // the stranded command is written again before any new traffic
    expect_command(&mut peer2, &cmd("PING")).await;
    reply(&mut peer2, b"+PONG\r\n").await;
    assert_eq!(
        handle.wait().await.unwrap(),
        Value::SimpleString("PONG".into())
    );
}

#[tokio::test]
async fn commands_submitted_while_reconnecting_run_on_the_new_transport() {
    let (local1, peer1) = pipe();
    let (local2, mut peer2) = pipe();
    let connector = QueueConnector::new([local1, local2]);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let conn = ManagedConnection::connect(connector, fast_config().event_listener(tx))
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Connected);

    drop(peer1);
    loop {
        if rx.recv().await.unwrap() == ConnectionEvent::Reconnecting {
            break;
        }
    }

    let handle = conn.submit(&cmd("PING"), ReplyShape::Value).await.unwrap();
    expect_command(&mut peer2, &cmd("PING")).await;
    reply(&mut peer2, b"+PONG\r\n").await;
    assert_eq!(
        handle.wait().await.unwrap(),
        Value::SimpleString("PONG".into())
    );
}

#[tokio::test]
async fn exhausted_retries_fail_everything_for_good() {
    let (local1, mut peer1) = pipe();
    let connector = QueueConnector::new([local1]);

    let conn = ManagedConnection::connect(
        connector,
        fast_config()
            .number_of_retries(2)
            .replay_policy(ReplayPolicy::RetryUnconfirmed),
    )
    .await
    .unwrap();

    let handle = conn.submit(&cmd("PING"), ReplyShape::Value).await.unwrap();
    expect_command(&mut peer1, &cmd("PING")).await;
    drop(peer1);

    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);

    // no transport is coming back; new submissions are refused
    let err = conn.submit(&cmd("PING"), ReplyShape::Value).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
}
