use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use snodebus_frame::FrameError;
use snodebus_session::{
    FailureReason, InboundMessage, PacketLink, Session, SessionConfig, SessionError,
};
use tokio::sync::broadcast;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// In-memory bus master: records every packet and answers through a
/// replaceable responder.
struct MockLink {
    packets: broadcast::Sender<Bytes>,
    sent: Mutex<Vec<Vec<u8>>>,
    responder: Mutex<Responder>,
}

impl MockLink {
    fn new(responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            packets: broadcast::channel(64).0,
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(responder)),
        })
    }

    /// Acks every Init and every Send-Message.
    fn cooperative() -> Arc<Self> {
        Self::new(|packet| match packet {
            [0x90, ..] => vec![vec![0x91]],
            [0x92, id, ..] => vec![vec![0x94, *id]],
            _ => Vec::new(),
        })
    }

    fn inject(&self, packet: &[u8]) {
        let _ = self.packets.send(Bytes::copy_from_slice(packet));
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_with(&self, opcode: u8) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter(|packet| packet.first() == Some(&opcode))
            .collect()
    }

    async fn wait_for_sent(&self, opcode: u8, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.sent_with(opcode).len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("packets sent within timeout");
    }
}

impl PacketLink for MockLink {
    async fn send(&self, packet: &[u8]) -> Result<(), FrameError> {
        self.sent.lock().unwrap().push(packet.to_vec());
        let replies = {
            let mut responder = self.responder.lock().unwrap();
            (*responder)(packet)
        };
        for reply in replies {
            let _ = self.packets.send(Bytes::from(reply));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.packets.subscribe()
    }
}

fn key(n: u8) -> [u8; 16] {
    [n; 16]
}

fn init_packet(keys: &[[u8; 16]]) -> Vec<u8> {
    let mut packet = vec![0x90, keys.len() as u8];
    for key in keys {
        packet.extend_from_slice(key);
    }
    packet
}

fn patient() -> SessionConfig {
    SessionConfig {
        timeout: Duration::from_secs(10),
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn first_send_runs_handshake_then_addresses_by_position() {
    let link = MockLink::cooperative();
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let a = session.register(&key(0xA0)).unwrap();
    let b = session.register(&key(0xB0)).unwrap();
    assert_eq!(a.id(), None);

    a.send(&[0xAB]).await.unwrap();
    b.send(&[0xCD, 0xEF]).await.unwrap();

    assert_eq!(
        link.sent(),
        vec![
            init_packet(&[key(0xA0), key(0xB0)]),
            vec![0x92, 0x00, 0xAB],
            vec![0x92, 0x01, 0xCD, 0xEF],
        ]
    );
    assert_eq!(a.id(), Some(0));
    assert_eq!(b.id(), Some(1));
    assert_eq!(session.generation(), 1);
    assert!(!session.is_dirty());
}

#[tokio::test]
async fn closing_an_endpoint_renumbers_the_rest() {
    let link = MockLink::cooperative();
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let a = session.register(&key(1)).unwrap();
    let b = session.register(&key(2)).unwrap();
    session.init(false).await.unwrap();
    assert_eq!((a.id(), b.id()), (Some(0), Some(1)));

    a.close();
    assert!(session.is_dirty());
    b.send(&[0x01]).await.unwrap();

    assert_eq!(link.sent_with(0x90).last().unwrap(), &init_packet(&[key(2)]));
    assert_eq!(link.sent_with(0x92), vec![vec![0x92, 0x00, 0x01]]);
    assert_eq!(b.id(), Some(0));
}

#[tokio::test]
async fn no_ack_is_retried_until_delivered() {
    let mut no_acks = 0;
    let link = MockLink::new(move |packet| match packet {
        [0x90, ..] => vec![vec![0x91]],
        [0x92, id, ..] if no_acks < 2 => {
            no_acks += 1;
            vec![vec![0x73, *id]]
        }
        [0x92, id, ..] => vec![vec![0x94, *id]],
        _ => Vec::new(),
    });
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let node = session.register(&key(7)).unwrap();

    node.send(&[0x10, 0x20]).await.unwrap();
    assert_eq!(link.sent_with(0x92).len(), 3);
}

#[tokio::test]
async fn busy_exhausts_the_retry_budget() {
    let link = MockLink::new(|packet| match packet {
        [0x90, ..] => vec![vec![0x91]],
        [0x92, id, ..] => vec![vec![0x70, *id]],
        _ => Vec::new(),
    });
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let node = session.register(&key(7)).unwrap();

    let err = node.send(&[0x01]).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::RetriesExhausted {
            attempts: 3,
            reason: FailureReason::Busy
        }
    ));
    assert_eq!(link.sent_with(0x92).len(), 3);
}

#[tokio::test]
async fn invalid_id_fails_without_retrying() {
    let link = MockLink::new(|packet| match packet {
        [0x90, ..] => vec![vec![0x91]],
        [0x92, id, ..] => vec![vec![0x72, *id]],
        _ => Vec::new(),
    });
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let node = session.register(&key(7)).unwrap();

    let err = node.send(&[0x01]).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Rejected(FailureReason::InvalidId)
    ));
    assert_eq!(link.sent_with(0x92).len(), 1);
}

#[tokio::test]
async fn invalid_size_fails_without_retrying() {
    let link = MockLink::new(|packet| match packet {
        [0x90, ..] => vec![vec![0x91]],
        [0x92, id, ..] => vec![vec![0x71, *id]],
        _ => Vec::new(),
    });
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let node = session.register(&key(7)).unwrap();

    let err = node.send(&[0x01]).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Rejected(FailureReason::InvalidSize)
    ));
    assert_eq!(link.sent_with(0x92).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn silence_times_out_each_attempt() {
    let link = MockLink::new(|packet| match packet {
        [0x90, ..] => vec![vec![0x91]],
        _ => Vec::new(),
    });
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let node = session.register(&key(7)).unwrap();

    let started = tokio::time::Instant::now();
    let err = node.send(&[0x01]).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::RetriesExhausted {
            attempts: 3,
            reason: FailureReason::Timeout
        }
    ));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1800), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1900), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn failed_handshake_is_surfaced_and_retried_on_next_send() {
    let mut inits = 0;
    let link = MockLink::new(move |packet| match packet {
        [0x90, ..] => {
            inits += 1;
            if inits == 1 {
                Vec::new()
            } else {
                vec![vec![0x91]]
            }
        }
        [0x92, id, ..] => vec![vec![0x94, *id]],
        _ => Vec::new(),
    });
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let node = session.register(&key(7)).unwrap();

    let err = node.send(&[0x01]).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::RetriesExhausted {
            attempts: 1,
            reason: FailureReason::Timeout
        }
    ));
    assert!(session.is_dirty());
    assert!(link.sent_with(0x92).is_empty());

    node.send(&[0x01]).await.unwrap();
    assert_eq!(link.sent_with(0x90).len(), 2);
}

#[tokio::test]
async fn concurrent_first_sends_share_one_handshake() {
    let link = MockLink::cooperative();
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let a = session.register(&key(1)).unwrap();
    let b = session.register(&key(2)).unwrap();
    let c = session.register(&key(3)).unwrap();

    let (ra, rb, rc) = tokio::join!(a.send(&[0x0A]), b.send(&[0x0B]), c.send(&[0x0C]));
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    assert_eq!(link.sent_with(0x90).len(), 1);
    let mut sends = link.sent_with(0x92);
    sends.sort();
    assert_eq!(
        sends,
        vec![
            vec![0x92, 0x00, 0x0A],
            vec![0x92, 0x01, 0x0B],
            vec![0x92, 0x02, 0x0C],
        ]
    );
}

#[tokio::test]
async fn force_init_always_handshakes() {
    let link = MockLink::cooperative();
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let _node = session.register(&key(1)).unwrap();

    session.init(false).await.unwrap();
    session.init(false).await.unwrap();
    assert_eq!(link.sent_with(0x90).len(), 1);

    session.init(true).await.unwrap();
    assert_eq!(link.sent_with(0x90).len(), 2);
    assert_eq!(session.generation(), 2);
}

#[tokio::test]
async fn sends_on_one_endpoint_are_serialized_in_order() {
    let link = MockLink::new(|packet| match packet {
        [0x90, ..] => vec![vec![0x91]],
        _ => Vec::new(),
    });
    let session = Session::new(Arc::clone(&link), patient());
    let node = Arc::new(session.register(&key(1)).unwrap());
    session.init(false).await.unwrap();

    let sender = Arc::clone(&node);
    let sends = tokio::spawn(async move {
        tokio::join!(
            sender.send(&[0x01]),
            sender.send(&[0x02]),
            sender.send(&[0x03])
        )
    });

    for expected in 1..=3u8 {
        link.wait_for_sent(0x92, expected as usize).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let sent = link.sent_with(0x92);
        assert_eq!(sent.len(), expected as usize, "one message in flight");
        assert_eq!(sent.last().unwrap(), &vec![0x92, 0x00, expected]);
        link.inject(&[0x94, 0x00]);
    }

    let (r1, r2, r3) = sends.await.unwrap();
    r1.unwrap();
    r2.unwrap();
    r3.unwrap();
}

#[tokio::test]
async fn sends_on_different_endpoints_are_in_flight_together() {
    let link = MockLink::new(|packet| match packet {
        [0x90, ..] => vec![vec![0x91]],
        _ => Vec::new(),
    });
    let session = Session::new(Arc::clone(&link), patient());
    let a = Arc::new(session.register(&key(1)).unwrap());
    let b = Arc::new(session.register(&key(2)).unwrap());
    session.init(false).await.unwrap();

    let (sender_a, sender_b) = (Arc::clone(&a), Arc::clone(&b));
    let sends = tokio::spawn(async move {
        tokio::join!(sender_a.send(&[0x0A]), sender_b.send(&[0x0B]))
    });

    // Nothing is acknowledged yet, so both packets must already be on the wire.
    link.wait_for_sent(0x92, 2).await;
    let mut in_flight = link.sent_with(0x92);
    in_flight.sort();
    assert_eq!(
        in_flight,
        vec![vec![0x92, 0x00, 0x0A], vec![0x92, 0x01, 0x0B]]
    );
    assert!(!sends.is_finished());

    link.inject(&[0x94, 0x01]);
    link.inject(&[0x94, 0x00]);
    let (ra, rb) = sends.await.unwrap();
    ra.unwrap();
    rb.unwrap();
    assert_eq!(link.sent_with(0x92).len(), 2);
}

#[tokio::test]
async fn renumbered_queued_send_fails_with_stale_id() {
    let link = MockLink::new(|packet| match packet {
        [0x90, ..] => vec![vec![0x91]],
        _ => Vec::new(),
    });
    let session = Session::new(Arc::clone(&link), patient());
    let a = session.register(&key(1)).unwrap();
    let b = Arc::new(session.register(&key(2)).unwrap());
    session.init(false).await.unwrap();
    assert_eq!(b.id(), Some(1));

    let sender = Arc::clone(&b);
    let sends = tokio::spawn(async move {
        tokio::join!(sender.send(&[0x01]), sender.send(&[0x02]))
    });
    link.wait_for_sent(0x92, 1).await;

    // Renumber while the second send is queued under id 1.
    a.close();
    let reinit = tokio::spawn({
        let session = session.clone();
        async move { session.init(false).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    link.inject(&[0x94, 0x01]);

    reinit.await.unwrap().unwrap();
    let (first, second) = sends.await.unwrap();
    first.unwrap();
    assert!(matches!(
        second,
        Err(SessionError::StaleId {
            expected: 1,
            current: Some(0)
        })
    ));
    assert_eq!(link.sent_with(0x92).len(), 1);
    assert_eq!(b.id(), Some(0));
}

#[tokio::test]
async fn inbound_messages_are_routed_by_current_id() {
    let link = MockLink::cooperative();
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let mut all = session.subscribe_messages();
    let a = session.register(&key(1)).unwrap();
    let b = session.register(&key(2)).unwrap();
    session.init(false).await.unwrap();

    link.inject(&[0x93, 0x01, 0x54, 0x00, 0x17]);
    link.inject(&[0x93, 0x00, 0x02]);

    let got_b = tokio::time::timeout(Duration::from_secs(1), b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got_b.as_ref(), &[0x54, 0x00, 0x17]);
    let got_a = tokio::time::timeout(Duration::from_secs(1), a.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got_a.as_ref(), &[0x02]);

    let first = all.recv().await.unwrap();
    assert_eq!(
        first,
        InboundMessage {
            id: 1,
            payload: Bytes::from_static(&[0x54, 0x00, 0x17]),
        }
    );
}

#[tokio::test]
async fn messages_for_unknown_ids_are_dropped() {
    let link = MockLink::cooperative();
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let a = session.register(&key(1)).unwrap();
    session.init(false).await.unwrap();

    link.inject(&[0x93, 0x05, 0xFF]);
    link.inject(&[0x42, 0x00]);
    link.inject(&[0x93, 0x00, 0x01]);

    let got = tokio::time::timeout(Duration::from_secs(1), a.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.as_ref(), &[0x01]);
}

#[tokio::test]
async fn register_validates_key_length() {
    let session = Session::new(MockLink::cooperative(), SessionConfig::default());
    let err = session.register(&[0u8; 15]).unwrap_err();
    assert!(matches!(err, SessionError::InvalidKeyLength(15)));
    assert_eq!(session.endpoint_count(), 0);
}

#[tokio::test]
async fn oversized_message_is_rejected_locally() {
    let link = MockLink::cooperative();
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let node = session.register(&key(1)).unwrap();

    let err = node.send(&[0u8; 254]).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::PayloadTooLarge { size: 254, max: 253 }
    ));
    assert!(link.sent().is_empty());

    node.send(&[0u8; 253]).await.unwrap();
}

#[tokio::test]
async fn closed_endpoint_refuses_sends_and_ends_recv() {
    let link = MockLink::cooperative();
    let session = Session::new(Arc::clone(&link), SessionConfig::default());
    let node = session.register(&key(1)).unwrap();

    node.close();
    assert!(node.is_closed());
    assert!(matches!(
        node.send(&[0x01]).await,
        Err(SessionError::EndpointClosed)
    ));
    assert_eq!(node.recv().await, None);
    assert_eq!(session.endpoint_count(), 0);
}

#[tokio::test]
async fn dropping_an_endpoint_closes_it() {
    let session = Session::new(MockLink::cooperative(), SessionConfig::default());
    let node = session.register(&key(1)).unwrap();
    assert_eq!(session.endpoint_count(), 1);
    drop(node);
    assert_eq!(session.endpoint_count(), 0);
    assert!(session.is_dirty());
}

#[tokio::test]
async fn session_close_fails_pending_and_future_sends() {
    let link = MockLink::new(|packet| match packet {
        [0x90, ..] => vec![vec![0x91]],
        _ => Vec::new(),
    });
    let session = Session::new(Arc::clone(&link), patient());
    let node = Arc::new(session.register(&key(1)).unwrap());

    let sender = Arc::clone(&node);
    let pending = tokio::spawn(async move { sender.send(&[0x01]).await });
    link.wait_for_sent(0x92, 1).await;

    session.close().await;
    assert!(matches!(
        pending.await.unwrap(),
        Err(SessionError::Closed)
    ));
    assert!(matches!(
        node.send(&[0x02]).await,
        Err(SessionError::Closed)
    ));
    assert_eq!(node.recv().await, None);
    assert!(matches!(
        session.register(&key(2)),
        Err(SessionError::Closed)
    ));
}
