//! Membership and broadcast coordination.
//!
//! The hub task owns the live set of clients. Every join, leave and broadcast
//! travels to it over one intake channel and is processed to completion before
//! the next event, so a broadcast always sees a consistent live set and no
//! lock guards the membership.
//!
//! Delivery never blocks the hub: each live client gets a `try_enqueue` onto
//! its bounded outbound queue, and a client whose queue is full is evicted in
//! the same step.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use axum::body::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    queue::{Enqueue, OutboundQueue, OutboundSender, outbound_queue},
    trace::{TraceEvent, Tracer},
};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one connected client. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A client as the hub sees it: an id and the producer half of its queue.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    outbound: OutboundSender,
}

impl Client {
    /// Allocates a fresh client. The returned queue is the consumer half that
    /// the client's write loop drains.
    pub fn new(queue_capacity: usize) -> (Self, OutboundQueue) {
        let (outbound, queue) = outbound_queue(queue_capacity);
        let client = Self {
            id: ClientId::next(),
            outbound,
        };
        (client, queue)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }
}

enum HubEvent {
    Join(Client),
    Leave(ClientId),
    Broadcast(Bytes),
    Members {
        respond_to: oneshot::Sender<Vec<ClientId>>,
    },
    Shutdown,
}

/// Cloneable handle for submitting events to a running hub.
///
/// Submissions never fail and never wait on the hub. Once the hub task has
/// exited they are dropped.
#[derive(Clone)]
pub struct Hub {
    intake: mpsc::UnboundedSender<HubEvent>,
}

impl Hub {
    /// Registers `client` as a broadcast target. Joining the same client twice
    /// is a caller bug; the hub keeps the first registration.
    pub fn join(&self, client: Client) {
        self.submit(HubEvent::Join(client));
    }

    /// Removes the client and closes its outbound queue. Redundant calls are
    /// no-ops.
    pub fn leave(&self, id: ClientId) {
        self.submit(HubEvent::Leave(id));
    }

    pub fn broadcast(&self, message: Bytes) {
        self.submit(HubEvent::Broadcast(message));
    }

    /// Snapshot of the live set, taken after every event submitted before it
    /// has been processed. Empty once the hub has stopped.
    pub async fn members(&self) -> Vec<ClientId> {
        let (respond_to, response) = oneshot::channel();
        self.submit(HubEvent::Members { respond_to });
        response.await.unwrap_or_default()
    }

    /// Closes every outbound queue and stops the hub task.
    pub fn shutdown(&self) {
        self.submit(HubEvent::Shutdown);
    }

    fn submit(&self, event: HubEvent) {
        if self.intake.send(event).is_err() {
            debug!("hub has stopped; dropping event");
        }
    }
}

/// Spawns the hub task. It runs until [`Hub::shutdown`] is called or every
/// `Hub` handle has been dropped.
pub fn spawn_hub(tracer: Arc<dyn Tracer>) -> (Hub, JoinHandle<()>) {
    let (intake, events) = mpsc::unbounded_channel();
    let task = tokio::spawn(HubLoop::new(tracer).run(events));
    (Hub { intake }, task)
}

struct HubLoop {
    clients: HashMap<ClientId, OutboundSender>,
    tracer: Arc<dyn Tracer>,
}

impl HubLoop {
    fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self {
            clients: HashMap::new(),
            tracer,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                HubEvent::Join(client) => self.join(client),
                HubEvent::Leave(id) => self.leave(id),
                HubEvent::Broadcast(message) => self.broadcast(message),
                HubEvent::Members { respond_to } => {
                    let mut members: Vec<_> = self.clients.keys().copied().collect();
                    members.sort_unstable();
                    let _ = respond_to.send(members);
                }
                HubEvent::Shutdown => break,
            }
        }

        info!(clients = self.clients.len(), "hub stopped, closing client queues");
        for (_, outbound) in self.clients.drain() {
            outbound.close();
        }
    }

    fn join(&mut self, client: Client) {
        let Client { id, outbound } = client;
        if self.clients.contains_key(&id) {
            warn!(client = %id, "client joined twice, ignoring second registration");
            return;
        }
        self.clients.insert(id, outbound);
        debug!(client = %id, live = self.clients.len(), "client joined");
        self.tracer.trace(&TraceEvent::Joined { client: id });
    }

    fn leave(&mut self, id: ClientId) {
        if let Some(outbound) = self.clients.remove(&id) {
            outbound.close();
            debug!(client = %id, live = self.clients.len(), "client left");
            self.tracer.trace(&TraceEvent::Left { client: id });
        }
    }

    fn broadcast(&mut self, message: Bytes) {
        self.tracer.trace(&TraceEvent::Received {
            message: message.clone(),
        });

        let mut evicted = Vec::new();
        for (id, outbound) in &self.clients {
            match outbound.try_enqueue(message.clone()) {
                Enqueue::Accepted => self.tracer.trace(&TraceEvent::Delivered { client: *id }),
                Enqueue::Full => {
                    warn!(client = %id, "outbound queue full, evicting client");
                    evicted.push(*id);
                }
                Enqueue::Closed => {
                    debug!(client = %id, "outbound queue already closed, evicting client");
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            if let Some(outbound) = self.clients.remove(&id) {
                outbound.close();
                self.tracer.trace(&TraceEvent::Evicted { client: id });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::trace::NoopTracer;

    #[derive(Default)]
    struct RecordingTracer {
        events: Mutex<Vec<TraceEvent>>,
    }

    impl RecordingTracer {
        fn events(&self) -> Vec<TraceEvent> {
            self.events.lock().expect("tracer lock").clone()
        }
    }

    impl Tracer for RecordingTracer {
        fn trace(&self, event: &TraceEvent) {
            self.events.lock().expect("tracer lock").push(event.clone());
        }
    }

    fn untraced_hub() -> Hub {
        spawn_hub(Arc::new(NoopTracer)).0
    }

    fn join(hub: &Hub, capacity: usize) -> (ClientId, OutboundQueue) {
        let (client, queue) = Client::new(capacity);
        let id = client.id();
        hub.join(client);
        (id, queue)
    }

    fn payload(text: &'static str) -> Bytes {
        Bytes::from_static(text.as_bytes())
    }

    fn sorted(mut ids: Vec<ClientId>) -> Vec<ClientId> {
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn live_set_tracks_joins_and_leaves() {
        let hub = untraced_hub();
        let (a, _qa) = join(&hub, 4);
        let (b, _qb) = join(&hub, 4);
        let (c, _qc) = join(&hub, 4);
        assert_eq!(hub.members().await, sorted(vec![a, b, c]));

        hub.leave(b);
        assert_eq!(hub.members().await, sorted(vec![a, c]));

        let (d, _qd) = join(&hub, 4);
        hub.leave(a);
        assert_eq!(hub.members().await, sorted(vec![c, d]));
    }

    #[tokio::test]
    async fn every_live_client_receives_broadcasts_in_order() {
        let hub = untraced_hub();
        let (_a, mut qa) = join(&hub, 8);
        let (_b, mut qb) = join(&hub, 8);

        for text in ["one", "two", "three"] {
            hub.broadcast(payload(text));
        }
        hub.members().await;

        for queue in [&mut qa, &mut qb] {
            assert_eq!(queue.try_dequeue(), Some(payload("one")));
            assert_eq!(queue.try_dequeue(), Some(payload("two")));
            assert_eq!(queue.try_dequeue(), Some(payload("three")));
            assert_eq!(queue.try_dequeue(), None);
        }
    }

    #[tokio::test]
    async fn departed_clients_receive_nothing_further() {
        let hub = untraced_hub();
        let (a, mut qa) = join(&hub, 8);
        let (_b, mut qb) = join(&hub, 8);

        hub.broadcast(payload("before"));
        hub.leave(a);
        hub.broadcast(payload("after"));
        hub.members().await;

        assert_eq!(qa.dequeue().await, Some(payload("before")));
        assert_eq!(qa.dequeue().await, None);
        assert_eq!(qb.try_dequeue(), Some(payload("before")));
        assert_eq!(qb.try_dequeue(), Some(payload("after")));
    }

    #[tokio::test]
    async fn full_queue_evicts_only_the_slow_client() {
        let hub = untraced_hub();
        let (fast, mut fast_queue) = join(&hub, 1);
        let (slow, mut slow_queue) = join(&hub, 1);

        hub.broadcast(payload("first"));
        hub.members().await;
        assert_eq!(fast_queue.try_dequeue(), Some(payload("first")));

        hub.broadcast(payload("second"));
        assert_eq!(hub.members().await, vec![fast]);
        assert_eq!(fast_queue.try_dequeue(), Some(payload("second")));

        // The evicted client drains what it already had, then sees the close.
        assert_eq!(slow_queue.dequeue().await, Some(payload("first")));
        assert_eq!(slow_queue.dequeue().await, None);
        assert!(!hub.members().await.contains(&slow));
    }

    #[tokio::test]
    async fn client_with_dropped_queue_is_removed_on_next_broadcast() {
        let hub = untraced_hub();
        let (gone, queue) = join(&hub, 4);
        let (live, mut live_queue) = join(&hub, 4);
        drop(queue);

        hub.broadcast(payload("ping"));
        assert_eq!(hub.members().await, vec![live]);
        assert_ne!(gone, live);
        assert_eq!(live_queue.try_dequeue(), Some(payload("ping")));
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let tracer = Arc::new(RecordingTracer::default());
        let (hub, _task) = spawn_hub(tracer.clone());
        let (a, mut qa) = join(&hub, 4);
        let (b, _qb) = join(&hub, 4);

        hub.leave(a);
        hub.leave(a);
        assert_eq!(hub.members().await, vec![b]);
        assert_eq!(qa.dequeue().await, None);

        let leaves = tracer
            .events()
            .into_iter()
            .filter(|event| matches!(event, TraceEvent::Left { .. }))
            .count();
        assert_eq!(leaves, 1);
    }

    #[tokio::test]
    async fn leave_after_eviction_is_a_no_op() {
        let hub = untraced_hub();
        let (slow, _slow_queue) = join(&hub, 1);
        let (other, _other_queue) = join(&hub, 8);

        hub.broadcast(payload("fill"));
        hub.broadcast(payload("overflow"));
        assert_eq!(hub.members().await, vec![other]);

        hub.leave(slow);
        assert_eq!(hub.members().await, vec![other]);
    }

    #[tokio::test]
    async fn duplicate_join_keeps_first_registration() {
        let hub = untraced_hub();
        let (client, mut queue) = Client::new(4);
        let id = client.id();
        hub.join(client);

        let (duplicate_outbound, _) = outbound_queue(4);
        hub.join(Client {
            id,
            outbound: duplicate_outbound,
        });
        hub.broadcast(payload("once"));

        assert_eq!(hub.members().await, vec![id]);
        assert_eq!(queue.try_dequeue(), Some(payload("once")));
    }

    #[tokio::test]
    async fn tracer_observes_hub_activity() {
        let tracer = Arc::new(RecordingTracer::default());
        let (hub, _task) = spawn_hub(tracer.clone());
        let (a, _qa) = join(&hub, 1);

        hub.broadcast(payload("hi"));
        hub.broadcast(payload("overflow"));
        hub.members().await;

        assert_eq!(
            tracer.events(),
            vec![
                TraceEvent::Joined { client: a },
                TraceEvent::Received {
                    message: payload("hi")
                },
                TraceEvent::Delivered { client: a },
                TraceEvent::Received {
                    message: payload("overflow")
                },
                TraceEvent::Evicted { client: a },
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_closes_every_queue() {
        let (hub, task) = spawn_hub(Arc::new(NoopTracer));
        let (_a, mut qa) = join(&hub, 4);
        let (_b, mut qb) = join(&hub, 4);

        hub.broadcast(payload("last"));
        hub.shutdown();
        task.await.expect("hub task");

        assert_eq!(qa.dequeue().await, Some(payload("last")));
        assert_eq!(qa.dequeue().await, None);
        assert_eq!(qb.dequeue().await, Some(payload("last")));
        assert_eq!(qb.dequeue().await, None);

        // Submissions after shutdown are dropped quietly.
        hub.broadcast(payload("ignored"));
        assert!(hub.members().await.is_empty());
    }

    #[tokio::test]
    async fn slow_client_is_evicted_while_others_continue() {
        const CAPACITY: usize = 4;
        let hub = untraced_hub();
        let (a, mut qa) = join(&hub, CAPACITY);
        let (b, mut qb) = join(&hub, CAPACITY);
        let (c, mut qc) = join(&hub, CAPACITY);

        hub.broadcast(payload("hello"));
        hub.members().await;
        for queue in [&mut qa, &mut qb, &mut qc] {
            assert_eq!(queue.try_dequeue(), Some(payload("hello")));
            assert_eq!(queue.try_dequeue(), None);
        }

        // B stops draining; A and C keep up.
        let sent: Vec<Bytes> = (0..=CAPACITY)
            .map(|n| Bytes::from(format!("msg-{n}")))
            .collect();
        for message in &sent {
            hub.broadcast(message.clone());
            hub.members().await;
            assert_eq!(qa.try_dequeue().as_ref(), Some(message));
            assert_eq!(qc.try_dequeue().as_ref(), Some(message));
        }
        assert_eq!(hub.members().await, sorted(vec![a, c]));

        let mut stalled = Vec::new();
        while let Some(message) = qb.dequeue().await {
            stalled.push(message);
        }
        assert_eq!(stalled, sent[..CAPACITY].to_vec());

        hub.leave(c);
        hub.broadcast(payload("bye"));
        assert_eq!(hub.members().await, vec![a]);

        assert_eq!(qa.try_dequeue(), Some(payload("bye")));
        assert_eq!(qc.dequeue().await, None);
        assert!(!hub.members().await.contains(&b));
    }
}
