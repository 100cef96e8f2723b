use replica_sync::{Broadcast, Broadcaster, HostMessage, Reply};
use replica_types::ConsumerId;
use tokio::sync::mpsc;

fn ready() -> Broadcast {
    Broadcast::DbReady {
        schema_version: None,
    }
}

#[test]
fn broadcast_reaches_every_consumer() {
    let mut broadcaster = Broadcaster::new();
    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    broadcaster.register(ConsumerId::new(), tx1);
    broadcaster.register(ConsumerId::new(), tx2);

    assert_eq!(broadcaster.broadcast(ready()), 2);
    assert_eq!(rx1.try_recv().unwrap(), HostMessage::Broadcast(ready()));
    assert_eq!(rx2.try_recv().unwrap(), HostMessage::Broadcast(ready()));
}

#[test]
fn dead_consumer_is_pruned_and_others_still_receive() {
    let mut broadcaster = Broadcaster::new();
    let (live_tx, mut live_rx) = mpsc::unbounded_channel();
    let (dead_tx, dead_rx) = mpsc::unbounded_channel();
    let live = ConsumerId::new();
    let dead = ConsumerId::new();
    broadcaster.register(live, live_tx);
    broadcaster.register(dead, dead_tx);
    drop(dead_rx);

    assert_eq!(broadcaster.broadcast(ready()), 1);
    assert!(broadcaster.contains(&live));
    assert!(!broadcaster.contains(&dead));
    assert!(live_rx.try_recv().is_ok());

    // Next broadcast is unaffected.
    assert_eq!(broadcaster.broadcast(ready()), 1);
}

#[test]
fn send_to_targets_one_consumer() {
    let mut broadcaster = Broadcaster::new();
    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let first = ConsumerId::new();
    broadcaster.register(first, tx1);
    broadcaster.register(ConsumerId::new(), tx2);

    let reply = HostMessage::Reply(Reply::Error {
        id: Some(1),
        error: "nope".into(),
    });
    assert!(broadcaster.send_to(&first, reply.clone()));
    assert_eq!(rx1.try_recv().unwrap(), reply);
    assert!(rx2.try_recv().is_err());
}

#[test]
fn send_to_dead_consumer_prunes_it() {
    let mut broadcaster = Broadcaster::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let id = ConsumerId::new();
    broadcaster.register(id, tx);
    drop(rx);

    assert!(!broadcaster.send_to(&id, HostMessage::Broadcast(ready())));
    assert!(broadcaster.is_empty());
    assert!(!broadcaster.send_to(&ConsumerId::new(), HostMessage::Broadcast(ready())));
}
