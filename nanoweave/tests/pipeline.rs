//! PUSH/PULL integration tests.

use std::collections::HashSet;
use std::time::Duration;

use nanoweave::prelude::*;

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

/// One push, two pulls: each pull gets exactly one of two messages
#[test]
fn test_round_robin_distribution() -> nanoweave::Result<()> {
    let engine = Engine::new()?;
    let push = Push0::open(&engine)?;
    push.listen("inproc://round-robin")?;

    let pulls = [Pull0::open(&engine)?, Pull0::open(&engine)?];
    for pull in &pulls {
        pull.set_recv_timeout(Some(Duration::from_secs(2)))?;
        pull.dial("inproc://round-robin")?;
    }
    push.wait_for_pipes(2, WAIT)?;

    push.send("job-a")?;
    push.send("job-b")?;

    let received: HashSet<Vec<u8>> = pulls
        .iter()
        .map(|pull| pull.recv().map(|m| m.as_bytes().to_vec()))
        .collect::<nanoweave::Result<_>>()?;
    let expected: HashSet<Vec<u8>> = [b"job-a".to_vec(), b"job-b".to_vec()].into();
    assert_eq!(received, expected);
    for pull in &pulls {
        assert_eq!(pull.try_recv().unwrap_err(), WeaveError::TryAgain);
    }
    Ok(())
}

#[test]
fn test_pull_keeps_arrival_order() -> nanoweave::Result<()> {
    let engine = Engine::new()?;
    let pull = Pull0::open(&engine)?;
    pull.listen("inproc://arrival-order")?;
    let push = Push0::open(&engine)?;
    push.dial("inproc://arrival-order")?;

    for i in 0..50 {
        push.send(format!("msg-{i}"))?;
    }
    for i in 0..50 {
        assert_eq!(pull.try_recv()?.as_bytes(), format!("msg-{i}").as_bytes());
    }
    Ok(())
}

#[test]
fn test_direction_is_enforced() -> nanoweave::Result<()> {
    let engine = Engine::new()?;
    let push = Push0::open(&engine)?;
    let pull = Pull0::open(&engine)?;
    assert_eq!(push.try_recv().unwrap_err().kind(), ErrorKind::NotSupported);
    assert_eq!(pull.try_send("x").unwrap_err().kind(), ErrorKind::NotSupported);
    Ok(())
}

/// Raw push still round-robins and honours an explicit pipe
#[test]
fn test_raw_push_targets_pipe() -> nanoweave::Result<()> {
    let engine = Engine::new()?;
    let push = Push0::raw(&engine)?;
    let first = Pull0::open(&engine)?;
    let second = Pull0::open(&engine)?;
    first.listen("inproc://raw-first")?;
    second.listen("inproc://raw-second")?;
    push.dial("inproc://raw-first")?;
    push.dial("inproc://raw-second")?;

    let to_second = push
        .pipes()
        .into_iter()
        .find(|p| p.remote_address().to_string() == "inproc://raw-second")
        .map(|p| p.id())
        .expect("pipe to second pull");
    for _ in 0..3 {
        push.send(Message::new("targeted").to_pipe(to_second))?;
    }
    assert_eq!(first.try_recv().unwrap_err(), WeaveError::TryAgain);
    for _ in 0..3 {
        assert_eq!(second.try_recv()?.as_bytes(), b"targeted");
    }
    Ok(())
}

/// A timed-out receive changes nothing; the next message is still delivered
#[test]
fn test_recv_timeout_then_message() -> nanoweave::Result<()> {
    let engine = Engine::new()?;
    let pull = Pull0::open(&engine)?;
    pull.listen("inproc://timeout-then-message")?;
    let push = Push0::open(&engine)?;
    push.dial("inproc://timeout-then-message")?;

    pull.set_recv_timeout(Some(Duration::from_millis(10)))?;
    assert_eq!(pull.recv().unwrap_err(), WeaveError::Timeout);

    push.send("after the timeout")?;
    assert_eq!(pull.recv()?.as_bytes(), b"after the timeout");
    Ok(())
}

/// A bounded puller stalls the pusher; receiving lets it continue
#[test]
fn test_buffers_push_back_on_sender() -> nanoweave::Result<()> {
    let engine = Engine::new()?;
    let pull = Pull0::open(&engine)?;
    pull.set_option("recv_buffer", 4)?;
    pull.listen("inproc://backpressure")?;
    let push = Push0::open(&engine)?;
    push.set_option("send_buffer", 4)?;
    push.dial("inproc://backpressure")?;
    push.wait_for_pipes(1, WAIT)?;

    let mut sent = 0;
    while push.try_send(format!("msg-{sent}")).is_ok() {
        sent += 1;
        assert!(sent <= 8, "sender was never held back");
    }
    assert_eq!(sent, 8);
    assert_eq!(push.try_send("more").unwrap_err(), WeaveError::TryAgain);

    assert_eq!(pull.recv()?.as_bytes(), b"msg-0");
    push.try_send("msg-8")?;
    for i in 1..=8 {
        assert_eq!(pull.recv()?.as_bytes(), format!("msg-{i}").as_bytes());
    }
    Ok(())
}
