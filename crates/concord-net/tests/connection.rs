//! Connection-core behaviour over an in-process transport pair

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use concord_crypto::KeyPair;
use concord_net::{Connection, ConnectionError, Transport};
use concord_protocol::{PeerId, Target};

/// Two connections wired back to back, each knowing the other as a peer
fn connected_pair() -> (Connection, Connection) {
    let (ta, tb) = Transport::pipe();
    let a = Connection::attach(KeyPair::generate(), ta);
    let b = Connection::attach(KeyPair::generate(), tb);

    a.set_local_id(PeerId::from("a"));
    b.set_local_id(PeerId::from("b"));
    a.add_peer(PeerId::from("b"), b.public_identity());
    b.add_peer(PeerId::from("a"), a.public_identity());
    a.mark_ready();
    b.mark_ready();
    a.start();
    b.start();
    (a, b)
}

#[tokio::test]
async fn request_response_roundtrip() {
    let (a, b) = connected_pair();

    b.on_request("echo", |_origin, text: String| async move { Ok(text) });

    let reply: String = a
        .send_request("echo", Target::Peer(PeerId::from("b")), &"hi".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "hi");
}

#[tokio::test]
async fn handler_error_becomes_remote_error() {
    let (a, b) = connected_pair();

    b.on_request("fail", |_origin, _: ()| async move {
        Err::<(), _>("boom".to_string())
    });

    let err = a
        .send_request::<_, ()>("fail", Target::Peer(PeerId::from("b")), &())
        .await
        .unwrap_err();
    match err {
        ConnectionError::Remote(message) => assert_eq!(message, "boom"),
        other => panic!("expected Remote, got {other:?}"),
    }
}

#[tokio::test]
async fn notification_reaches_handler_with_origin() {
    let (a, b) = connected_pair();

    let seen = Arc::new(std::sync::Mutex::new(None));
    b.on_notification("note", {
        let seen = Arc::clone(&seen);
        move |origin, text: String| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock().unwrap() = Some((origin, text));
            }
        }
    });

    a.send_notification("note", Target::Peer(PeerId::from("b")), &"x".to_string())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let got = seen.lock().unwrap().take().unwrap();
    assert_eq!(got, (Some(PeerId::from("a")), "x".to_string()));
}

#[tokio::test]
async fn broadcast_reaches_peer() {
    let (a, b) = connected_pair();

    let hits = Arc::new(AtomicU32::new(0));
    b.on_broadcast("tick", {
        let hits = Arc::clone(&hits);
        move |origin, _: ()| {
            let hits = Arc::clone(&hits);
            async move {
                assert_eq!(origin, Some(PeerId::from("a")));
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    a.send_broadcast("tick", &()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn broadcast_with_empty_roster_is_skipped() {
    let (ta, tb) = Transport::pipe();
    let a = Connection::attach(KeyPair::generate(), ta);
    let b = Connection::attach(KeyPair::generate(), tb);
    a.mark_ready();
    b.mark_ready();
    a.start();
    b.start();

    let hit = Arc::new(AtomicBool::new(false));
    b.on_broadcast("tick", {
        let hit = Arc::clone(&hit);
        move |_, _: ()| {
            let hit = Arc::clone(&hit);
            async move {
                hit.store(true, Ordering::SeqCst);
            }
        }
    });

    // No peers known: nothing must go on the wire
    a.send_broadcast("tick", &()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!hit.load(Ordering::SeqCst));
    assert_eq!(a.seal_operations(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let (a, _b) = connected_pair();

    // No handler registered on b: the request is dropped silently and the
    // caller runs into its deadline.
    let started = tokio::time::Instant::now();
    let err = a
        .send_request::<_, ()>("nobody.home", Target::Peer(PeerId::from("b")), &())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Timeout));
    assert_eq!(started.elapsed(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn late_response_is_dropped() {
    let (a, b) = connected_pair();

    b.on_request("slow", |_origin, _: ()| async move {
        tokio::time::sleep(Duration::from_secs(120)).await;
        Ok("late".to_string())
    });

    let err = a
        .send_request::<_, String>("slow", Target::Peer(PeerId::from("b")), &())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Timeout));

    // Let the slow handler finish and its response arrive; the request id
    // is gone from the map, so the reply is dropped and the connection
    // keeps working.
    tokio::time::sleep(Duration::from_secs(120)).await;

    b.on_request("echo", |_origin, text: String| async move { Ok(text) });
    let reply: String = a
        .send_request("echo", Target::Peer(PeerId::from("b")), &"ok".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "ok");
}

#[tokio::test]
async fn peer_disposal_fails_pending_requests() {
    let (a, b) = connected_pair();

    let pending = tokio::spawn({
        let a = a.clone();
        async move {
            a.send_request::<_, ()>("nobody.home", Target::Peer(PeerId::from("b")), &())
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    b.dispose();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ConnectionError::Disconnected));
    assert!(a.is_disposed());
}

#[tokio::test]
async fn concurrent_requests_correlate_by_id() {
    let (a, b) = connected_pair();

    b.on_request("echo", |_origin, n: u32| async move { Ok(n) });

    let mut tasks = Vec::new();
    for n in 0..32u32 {
        let a = a.clone();
        tasks.push(tokio::spawn(async move {
            let reply: u32 = a
                .send_request("echo", Target::Peer(PeerId::from("b")), &n)
                .await
                .unwrap();
            (n, reply)
        }));
    }
    for task in tasks {
        let (sent, got) = task.await.unwrap();
        assert_eq!(sent, got);
    }
}

#[tokio::test]
async fn sends_wait_for_ready_barrier() {
    let (ta, tb) = Transport::pipe();
    let a = Connection::attach(KeyPair::generate(), ta);
    let b = Connection::attach(KeyPair::generate(), tb);
    a.set_local_id(PeerId::from("a"));
    b.set_local_id(PeerId::from("b"));
    a.add_peer(PeerId::from("b"), b.public_identity());
    b.add_peer(PeerId::from("a"), a.public_identity());
    b.mark_ready();
    a.start();
    b.start();

    b.on_request("echo", |_origin, text: String| async move { Ok(text) });

    let request = tokio::spawn({
        let a = a.clone();
        async move {
            a.send_request::<_, String>("echo", Target::Peer(PeerId::from("b")), &"hi".to_string())
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!request.is_finished());

    a.mark_ready();
    assert_eq!(request.await.unwrap().unwrap(), "hi");
}

#[tokio::test]
async fn cleartext_after_handshake_is_dropped() {
    let (a, b) = connected_pair();

    let hit = Arc::new(AtomicBool::new(false));
    b.on_notification("note", {
        let hit = Arc::clone(&hit);
        move |_, _: String| {
            let hit = Arc::clone(&hit);
            async move {
                hit.store(true, Ordering::SeqCst);
            }
        }
    });

    a.send_clear_notification("note", Target::Peer(PeerId::from("b")), &"x".to_string())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!hit.load(Ordering::SeqCst));
}

#[tokio::test]
async fn seal_cache_skips_repeat_asymmetric_work() {
    let (a, b) = connected_pair();

    let hits = Arc::new(AtomicU32::new(0));
    b.on_broadcast("tick", {
        let hits = Arc::clone(&hits);
        move |_, _: ()| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    a.send_broadcast("tick", &()).await.unwrap();
    a.send_broadcast("tick", &()).await.unwrap();
    a.send_broadcast("tick", &()).await.unwrap();

    // One recipient, one seal; the rest served from cache
    assert_eq!(a.seal_operations(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn roster_change_invalidates_seal_cache() {
    let (a, _b) = connected_pair();

    a.send_notification("note", Target::Peer(PeerId::from("b")), &())
        .await
        .unwrap();
    assert_eq!(a.seal_operations(), 1);

    // A third peer joins: the caches drop, so the next send re-seals
    let c = KeyPair::generate();
    a.add_peer(PeerId::from("c"), c.public());

    a.send_notification("note", Target::Peer(PeerId::from("b")), &())
        .await
        .unwrap();
    assert_eq!(a.seal_operations(), 2);
}
