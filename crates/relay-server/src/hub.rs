//! The hub: single owner of the live set.
//!
//! Connections never reach each other directly. They talk to the hub through
//! its channels and only the hub task mutates the membership map, so fan-out
//! needs no lock. Each member is represented by the sending half of its
//! mailbox; dropping that sender is how the hub closes a mailbox.
//!
//! Events are taken in a fixed order (register, deregister, broadcast,
//! query) so a registration enqueued before a broadcast is always visible to
//! that broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::{counter, gauge};
use relay_core::ConnectionId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::errors::HubError;
use crate::metrics::{
    RELAY_BROADCASTS_TOTAL, RELAY_CONNECTIONS_ACTIVE, RELAY_CONNECTIONS_TOTAL,
    RELAY_DELIVERIES_TOTAL, RELAY_EVICTIONS_TOTAL,
};

/// An outbound text payload, shared by every recipient of one broadcast.
pub type Payload = Arc<str>;

/// Who receives a broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Audience {
    /// Every live member except the declared sender.
    Others(ConnectionId),
    /// Every live member (server-originated or sender-inclusive).
    Everyone,
    /// A single member.
    Only(ConnectionId),
}

impl Audience {
    /// Whether `id` is a recipient.
    pub fn includes(&self, id: &ConnectionId) -> bool {
        match self {
            Self::Others(sender) => sender != id,
            Self::Everyone => true,
            Self::Only(target) => target == id,
        }
    }
}

/// A broadcast request: payload plus audience.
#[derive(Clone, Debug)]
pub struct BroadcastEnvelope {
    /// Text delivered verbatim to each recipient.
    pub payload: Payload,
    /// Recipients.
    pub audience: Audience,
}

impl BroadcastEnvelope {
    /// Relay from `sender` to everyone else.
    pub fn from_sender(payload: impl Into<Payload>, sender: ConnectionId) -> Self {
        Self {
            payload: payload.into(),
            audience: Audience::Others(sender),
        }
    }

    /// Deliver to every live member.
    pub fn to_everyone(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            audience: Audience::Everyone,
        }
    }

    /// Deliver to `target` only.
    pub fn to_one(payload: impl Into<Payload>, target: ConnectionId) -> Self {
        Self {
            payload: payload.into(),
            audience: Audience::Only(target),
        }
    }
}

/// Outcome of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Mailboxes the payload was enqueued into.
    pub delivered: usize,
    /// Members removed because their mailbox was full or closed.
    pub evicted: usize,
}

struct Registration {
    id: ConnectionId,
    mailbox: mpsc::Sender<Payload>,
}

/// Command channels that still have live senders.
#[allow(clippy::struct_excessive_bools)]
#[derive(Clone, Copy)]
struct OpenInputs {
    register: bool,
    unregister: bool,
    broadcast: bool,
    query: bool,
}

impl Default for OpenInputs {
    fn default() -> Self {
        Self {
            register: true,
            unregister: true,
            broadcast: true,
            query: true,
        }
    }
}

impl OpenInputs {
    fn any(self) -> bool {
        self.register || self.unregister || self.broadcast || self.query
    }
}

/// The hub event loop. Create with [`Hub::new`], drive with [`Hub::run`].
pub struct Hub {
    members: HashMap<ConnectionId, mpsc::Sender<Payload>>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::UnboundedReceiver<ConnectionId>,
    broadcast_rx: mpsc::Receiver<BroadcastEnvelope>,
    query_rx: mpsc::Receiver<oneshot::Sender<Vec<ConnectionId>>>,
    live: Arc<AtomicUsize>,
}

impl Hub {
    /// Build a hub and the handle used to talk to it.
    ///
    /// `command_capacity` bounds the register, broadcast and query channels.
    /// Deregistration is unbounded so it can be submitted from a `Drop`.
    pub fn new(command_capacity: usize) -> (Self, HubHandle) {
        let capacity = command_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let (query_tx, query_rx) = mpsc::channel(capacity);
        let live = Arc::new(AtomicUsize::new(0));

        let hub = Self {
            members: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            query_rx,
            live: Arc::clone(&live),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            query_tx,
            live,
        };
        (hub, handle)
    }

    /// Process events until `shutdown` fires or every handle is dropped.
    ///
    /// On exit every remaining mailbox is closed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("hub started");
        let mut open = OpenInputs::default();
        while open.any() {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                reg = self.register_rx.recv(), if open.register => match reg {
                    Some(reg) => self.register(reg),
                    None => open.register = false,
                },
                id = self.unregister_rx.recv(), if open.unregister => match id {
                    Some(id) => {
                        let _ = self.deregister(&id);
                    }
                    None => open.unregister = false,
                },
                envelope = self.broadcast_rx.recv(), if open.broadcast => match envelope {
                    Some(envelope) => {
                        let _ = self.deliver(&envelope);
                    }
                    None => open.broadcast = false,
                },
                reply = self.query_rx.recv(), if open.query => match reply {
                    Some(reply) => {
                        let _ = reply.send(self.members.keys().cloned().collect());
                    }
                    None => open.query = false,
                },
            }
        }
        let closed = self.close_all();
        info!(closed, "hub stopped");
    }

    fn register(&mut self, reg: Registration) {
        if self.members.insert(reg.id.clone(), reg.mailbox).is_some() {
            warn!(conn_id = %reg.id, "identity registered twice, previous mailbox closed");
        }
        counter!(RELAY_CONNECTIONS_TOTAL).increment(1);
        self.publish_count();
        debug!(conn_id = %reg.id, live = self.members.len(), "registered");
    }

    /// Remove `id`, dropping (and so closing) its mailbox. Unknown ids are a
    /// no-op.
    fn deregister(&mut self, id: &ConnectionId) -> bool {
        let removed = self.members.remove(id).is_some();
        if removed {
            self.publish_count();
            debug!(conn_id = %id, live = self.members.len(), "deregistered");
        } else {
            trace!(conn_id = %id, "deregister for unknown member ignored");
        }
        removed
    }

    /// Fan `envelope` out without blocking. Members whose mailbox is full or
    /// closed are removed.
    fn deliver(&mut self, envelope: &BroadcastEnvelope) -> Delivery {
        let mut delivery = Delivery::default();
        let mut dropped = Vec::new();

        for (id, mailbox) in &self.members {
            if !envelope.audience.includes(id) {
                continue;
            }
            match mailbox.try_send(Arc::clone(&envelope.payload)) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(conn_id = %id, "mailbox full, evicting slow consumer");
                    dropped.push(id.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn_id = %id, "mailbox closed, removing member");
                    dropped.push(id.clone());
                }
            }
        }

        for id in &dropped {
            let _ = self.members.remove(id);
        }
        delivery.evicted = dropped.len();
        if delivery.evicted > 0 {
            counter!(RELAY_EVICTIONS_TOTAL).increment(delivery.evicted as u64);
            self.publish_count();
        }

        counter!(RELAY_BROADCASTS_TOTAL).increment(1);
        counter!(RELAY_DELIVERIES_TOTAL).increment(delivery.delivered as u64);
        trace!(
            recipients = delivery.delivered,
            evicted = delivery.evicted,
            bytes = envelope.payload.len(),
            "broadcast"
        );
        delivery
    }

    fn close_all(&mut self) -> usize {
        let closed = self.members.len();
        self.members.clear();
        self.publish_count();
        closed
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_count(&self) {
        let n = self.members.len();
        self.live.store(n, Ordering::Release);
        gauge!(RELAY_CONNECTIONS_ACTIVE).set(n as f64);
    }
}

/// Cloneable handle for submitting events to a running [`Hub`].
#[derive(Clone, Debug)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::UnboundedSender<ConnectionId>,
    broadcast_tx: mpsc::Sender<BroadcastEnvelope>,
    query_tx: mpsc::Sender<oneshot::Sender<Vec<ConnectionId>>>,
    live: Arc<AtomicUsize>,
}

impl HubHandle {
    /// Add `id` to the live set with `mailbox` as its outbound queue.
    pub async fn register(
        &self,
        id: ConnectionId,
        mailbox: mpsc::Sender<Payload>,
    ) -> Result<(), HubError> {
        self.register_tx
            .send(Registration { id, mailbox })
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Remove `id` from the live set. Never blocks, so it is safe from `Drop`.
    pub fn deregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.unregister_tx.send(id).map_err(|_| HubError::Stopped)
    }

    /// Submit a broadcast. Waits only for room in the hub's queue, never for
    /// recipients.
    pub async fn broadcast(&self, envelope: BroadcastEnvelope) -> Result<(), HubError> {
        self.broadcast_tx
            .send(envelope)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Current live set, as seen after every event queued before this call.
    pub async fn members(&self) -> Result<Vec<ConnectionId>, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx
            .send(reply_tx)
            .await
            .map_err(|_| HubError::Stopped)?;
        reply_rx.await.map_err(|_| HubError::Stopped)
    }

    /// Live set size as last published by the hub.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Whether the hub task is still accepting events.
    pub fn is_running(&self) -> bool {
        !self.broadcast_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;

    fn spawn_hub() -> (HubHandle, CancellationToken, tokio::task::JoinHandle<()>) {
        let (hub, handle) = Hub::new(64);
        let token = CancellationToken::new();
        let task = tokio::spawn(hub.run(token.clone()));
        (handle, token, task)
    }

    async fn join(
        handle: &HubHandle,
        name: &str,
        capacity: usize,
    ) -> (ConnectionId, mpsc::Receiver<Payload>) {
        let id = ConnectionId::from(name);
        let (tx, rx) = mpsc::channel(capacity);
        handle.register(id.clone(), tx).await.unwrap();
        (id, rx)
    }

    fn member(hub: &mut Hub, name: &str, capacity: usize) -> mpsc::Receiver<Payload> {
        let (tx, rx) = mpsc::channel(capacity);
        hub.register(Registration {
            id: ConnectionId::from(name),
            mailbox: tx,
        });
        rx
    }

    #[test]
    fn audience_membership() {
        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        assert!(!Audience::Others(a.clone()).includes(&a));
        assert!(Audience::Others(a.clone()).includes(&b));
        assert!(Audience::Everyone.includes(&a));
        assert!(Audience::Only(b.clone()).includes(&b));
        assert!(!Audience::Only(b).includes(&a));
    }

    #[test]
    fn others_reaches_all_but_sender() {
        let (mut hub, _handle) = Hub::new(8);
        let mut a = member(&mut hub, "a", 4);
        let mut b = member(&mut hub, "b", 4);
        let mut c = member(&mut hub, "c", 4);

        let delivery = hub.deliver(&BroadcastEnvelope::from_sender("hi", ConnectionId::from("a")));
        assert_eq!(delivery, Delivery { delivered: 2, evicted: 0 });
        assert_matches!(a.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(&*b.try_recv().unwrap(), "hi");
        assert_eq!(&*c.try_recv().unwrap(), "hi");
    }

    #[test]
    fn sole_member_sender_reaches_nobody() {
        let (mut hub, _handle) = Hub::new(8);
        let mut s = member(&mut hub, "s", 4);

        let delivery = hub.deliver(&BroadcastEnvelope::from_sender("x", ConnectionId::from("s")));
        assert_eq!(delivery, Delivery::default());
        assert_matches!(s.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn others_from_unknown_sender_reaches_everyone() {
        let (mut hub, _handle) = Hub::new(8);
        let _a = member(&mut hub, "a", 4);
        let _b = member(&mut hub, "b", 4);

        let envelope = BroadcastEnvelope::from_sender("x", ConnectionId::from("gone"));
        let delivery = hub.deliver(&envelope);
        assert_eq!(delivery.delivered, 2);
    }

    #[test]
    fn everyone_includes_sender() {
        let (mut hub, _handle) = Hub::new(8);
        let mut a = member(&mut hub, "a", 4);
        let mut b = member(&mut hub, "b", 4);

        let delivery = hub.deliver(&BroadcastEnvelope::to_everyone("all"));
        assert_eq!(delivery.delivered, 2);
        assert_eq!(&*a.try_recv().unwrap(), "all");
        assert_eq!(&*b.try_recv().unwrap(), "all");
    }

    #[test]
    fn only_targets_one_member() {
        let (mut hub, _handle) = Hub::new(8);
        let mut a = member(&mut hub, "a", 4);
        let mut b = member(&mut hub, "b", 4);

        let delivery = hub.deliver(&BroadcastEnvelope::to_one("ack", ConnectionId::from("b")));
        assert_eq!(delivery.delivered, 1);
        assert_matches!(a.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(&*b.try_recv().unwrap(), "ack");
    }

    #[test]
    fn full_mailbox_is_evicted_and_closed() {
        let (mut hub, handle) = Hub::new(8);
        let mut slow = member(&mut hub, "slow", 1);
        let mut fast = member(&mut hub, "fast", 8);

        let first = hub.deliver(&BroadcastEnvelope::to_everyone("one"));
        assert_eq!(first.delivered, 2);

        let second = hub.deliver(&BroadcastEnvelope::to_everyone("two"));
        assert_eq!(second, Delivery { delivered: 1, evicted: 1 });
        assert_eq!(hub.members.len(), 1);
        assert_eq!(handle.live_count(), 1);

        assert_eq!(&*slow.try_recv().unwrap(), "one");
        assert_matches!(slow.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(&*fast.try_recv().unwrap(), "one");
        assert_eq!(&*fast.try_recv().unwrap(), "two");
    }

    #[test]
    fn closed_mailbox_is_removed() {
        let (mut hub, handle) = Hub::new(8);
        let gone = member(&mut hub, "gone", 4);
        let _kept = member(&mut hub, "kept", 4);
        drop(gone);

        let delivery = hub.deliver(&BroadcastEnvelope::to_everyone("x"));
        assert_eq!(delivery, Delivery { delivered: 1, evicted: 1 });
        assert!(!hub.members.contains_key(&ConnectionId::from("gone")));
        assert_eq!(handle.live_count(), 1);
    }

    #[test]
    fn deregister_closes_mailbox_and_is_idempotent() {
        let (mut hub, handle) = Hub::new(8);
        let mut rx = member(&mut hub, "a", 4);
        let id = ConnectionId::from("a");

        assert!(hub.deregister(&id));
        assert!(!hub.deregister(&id));
        assert_eq!(handle.live_count(), 0);
        assert_matches!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn broadcast_to_empty_hub_delivers_nothing() {
        let (mut hub, _handle) = Hub::new(8);
        let delivery = hub.deliver(&BroadcastEnvelope::to_everyone("x"));
        assert_eq!(delivery, Delivery::default());
    }

    #[tokio::test]
    async fn register_is_visible_to_following_broadcast() {
        let (handle, token, task) = spawn_hub();
        let (a, _a_rx) = join(&handle, "a", 8).await;
        let (_b, mut b_rx) = join(&handle, "b", 8).await;

        handle
            .broadcast(BroadcastEnvelope::from_sender("hello", a))
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&*got, "hello");

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn live_count_tracks_register_and_deregister() {
        let (handle, token, task) = spawn_hub();
        let (a, _a_rx) = join(&handle, "a", 8).await;
        let (_b, _b_rx) = join(&handle, "b", 8).await;
        let (_c, _c_rx) = join(&handle, "c", 8).await;

        handle.deregister(a.clone()).unwrap();
        handle.deregister(a).unwrap();

        let members = handle.members().await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(handle.live_count(), 2);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_every_mailbox() {
        let (handle, token, task) = spawn_hub();
        let (_a, mut a_rx) = join(&handle, "a", 8).await;
        let (_b, mut b_rx) = join(&handle, "b", 8).await;
        assert_eq!(handle.members().await.unwrap().len(), 2);

        token.cancel();
        task.await.unwrap();

        assert!(a_rx.recv().await.is_none());
        assert!(b_rx.recv().await.is_none());
        assert_eq!(handle.live_count(), 0);
        assert!(!handle.is_running());
        assert_eq!(
            handle.broadcast(BroadcastEnvelope::to_everyone("late")).await,
            Err(HubError::Stopped)
        );
        assert_eq!(handle.members().await, Err(HubError::Stopped));
    }

    #[tokio::test]
    async fn hub_exits_when_all_handles_drop() {
        let (hub, handle) = Hub::new(4);
        let task = tokio::spawn(hub.run(CancellationToken::new()));
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn hub_outlives_dropped_clones() {
        let (hub, handle) = Hub::new(4);
        let task = tokio::spawn(hub.run(CancellationToken::new()));
        let clone = handle.clone();
        drop(clone);

        let (_a, _a_rx) = join(&handle, "a", 4).await;
        assert_eq!(handle.members().await.unwrap().len(), 1);
        assert!(!task.is_finished());

        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[derive(Clone, Debug)]
    enum Op {
        Register(u8),
        Deregister(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Register),
            (0u8..16).prop_map(Op::Deregister),
        ]
    }

    proptest! {
        #[test]
        fn live_set_matches_model(ops in proptest::collection::vec(op(), 0..64)) {
            let (mut hub, handle) = Hub::new(8);
            let mut model = HashSet::new();
            let mut mailboxes = Vec::new();

            for op in ops {
                match op {
                    Op::Register(n) => {
                        mailboxes.push(member(&mut hub, &format!("p{n}"), 1));
                        let _ = model.insert(n);
                    }
                    Op::Deregister(n) => {
                        let removed = hub.deregister(&ConnectionId::from(format!("p{n}").as_str()));
                        prop_assert_eq!(removed, model.remove(&n));
                    }
                }
                prop_assert_eq!(hub.members.len(), model.len());
                prop_assert_eq!(handle.live_count(), model.len());
            }

            if let Some(&sender) = model.iter().next() {
                let delivery = hub.deliver(&BroadcastEnvelope::from_sender(
                    "x",
                    ConnectionId::from(format!("p{sender}").as_str()),
                ));
                prop_assert_eq!(delivery.delivered + delivery.evicted, model.len() - 1);
            }
        }
    }
}
