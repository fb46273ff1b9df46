//! Per-connection pumps.
//!
//! Every accepted connection runs two tasks:
//!
//! - the **inbound pump** reads frames in order, classifies text payloads and
//!   turns them into world updates and broadcast requests;
//! - the **outbound pump** drains the connection's mailbox to the wire and
//!   keeps the peer alive with pings.
//!
//! They share a `CancellationToken` as the close signal: whichever side
//! stops first cancels it and the other follows. Cleanup is a drop guard
//! owned by the inbound pump, so it runs exactly once however the pump ends.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use relay_core::protocol::{PositionAck, parse_position};
use relay_core::{ConnectionId, Position, World};
use relay_settings::{ConnectionSettings, HubSettings, InboundPolicy, SenderPolicy};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::transport::{Frame, FrameSink, FrameStream, TransportError};
use crate::errors::HubError;
use crate::hub::{BroadcastEnvelope, HubHandle, Payload};
use crate::metrics::{RELAY_DISCONNECTIONS_TOTAL, RELAY_POSITION_UPDATES_TOTAL};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Peer is going away (page unload, process exit).
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Why an inbound pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundExit {
    /// The peer sent a close frame.
    PeerClosed(Option<u16>),
    /// The stream ended without a close frame.
    StreamEnded,
    /// The transport reported an error.
    ReadError(TransportError),
    /// No pong arrived within the liveness window.
    ReadTimeout,
    /// The outbound side closed the connection.
    LocalClose,
    /// The hub stopped accepting broadcasts.
    HubStopped,
}

impl InboundExit {
    /// Whether this is an ordinary way for a connection to end.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::PeerClosed(Some(CLOSE_NORMAL | CLOSE_GOING_AWAY))
                | Self::StreamEnded
                | Self::ReadError(TransportError::Reset)
                | Self::LocalClose
        )
    }
}

/// Why an outbound pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundExit {
    /// The hub closed the mailbox (deregistration, eviction or shutdown).
    MailboxClosed,
    /// The inbound side closed the connection.
    LocalClose,
    /// A frame could not be written in time.
    WriteFailed(TransportError),
}

/// A registered connection and its two pump tasks.
#[derive(Debug)]
pub struct AcceptedConnection {
    /// Identity assigned at construction.
    pub id: ConnectionId,
    /// Inbound pump task.
    pub inbound: JoinHandle<InboundExit>,
    /// Outbound pump task.
    pub outbound: JoinHandle<OutboundExit>,
}

/// Builds, registers and starts connections.
#[derive(Clone, Debug)]
pub struct ConnectionFactory {
    hub: HubHandle,
    world: Option<Arc<World>>,
    settings: ConnectionSettings,
    inbound_policy: InboundPolicy,
    sender_policy: SenderPolicy,
}

impl ConnectionFactory {
    /// Create a factory. `world` is `None` when positions are not tracked.
    pub fn new(
        hub: HubHandle,
        world: Option<Arc<World>>,
        settings: ConnectionSettings,
        hub_settings: &HubSettings,
    ) -> Self {
        Self {
            hub,
            world,
            settings,
            inbound_policy: hub_settings.inbound_policy,
            sender_policy: hub_settings.sender_policy,
        }
    }

    /// Register one connection over `stream`/`sink` and spawn both pumps.
    ///
    /// Registration completes before either pump starts, so the first
    /// inbound message already sees this connection in the live set.
    pub async fn accept<S, K>(&self, stream: S, sink: K) -> Result<AcceptedConnection, HubError>
    where
        S: FrameStream,
        K: FrameSink,
    {
        let id = ConnectionId::new();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.settings.mailbox_capacity.max(1));
        self.hub.register(id.clone(), mailbox_tx).await?;

        let closer = CancellationToken::new();
        let guard = CleanupGuard {
            id: id.clone(),
            hub: self.hub.clone(),
            world: self.world.clone(),
            closer: closer.clone(),
        };
        let reader = Inbound {
            id: id.clone(),
            hub: self.hub.clone(),
            world: self.world.clone(),
            policy: self.inbound_policy,
            sender_policy: self.sender_policy,
            pong_wait: self.settings.pong_wait(),
        };
        let writer = Outbound {
            id: id.clone(),
            write_wait: self.settings.write_wait(),
            ping_period: self.settings.ping_period(),
        };

        let inbound = tokio::spawn(reader.run(stream, guard));
        let outbound = tokio::spawn(writer.run(sink, mailbox_rx, closer));
        debug!(conn_id = %id, "connection started");

        Ok(AcceptedConnection {
            id,
            inbound,
            outbound,
        })
    }
}

/// Runs the exit sequence once, on every path out of the inbound pump.
struct CleanupGuard {
    id: ConnectionId,
    hub: HubHandle,
    world: Option<Arc<World>>,
    closer: CancellationToken,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        // World removal precedes deregistration.
        if let Some(world) = &self.world {
            let _ = world.remove_player(&self.id);
        }
        if self.hub.deregister(self.id.clone()).is_err() {
            debug!(conn_id = %self.id, "hub already stopped");
        }
        self.closer.cancel();
        counter!(RELAY_DISCONNECTIONS_TOTAL).increment(1);
        debug!(conn_id = %self.id, "connection cleaned up");
    }
}

struct Inbound {
    id: ConnectionId,
    hub: HubHandle,
    world: Option<Arc<World>>,
    policy: InboundPolicy,
    sender_policy: SenderPolicy,
    pong_wait: Duration,
}

impl Inbound {
    async fn run<S: FrameStream>(self, mut stream: S, guard: CleanupGuard) -> InboundExit {
        let exit = self.read_loop(&mut stream, &guard.closer).await;
        if exit.is_expected() {
            info!(conn_id = %self.id, reason = ?exit, "connection closed");
        } else {
            warn!(conn_id = %self.id, reason = ?exit, "connection closed unexpectedly");
        }
        drop(guard);
        exit
    }

    async fn read_loop<S: FrameStream>(
        &self,
        stream: &mut S,
        closer: &CancellationToken,
    ) -> InboundExit {
        let mut deadline = Instant::now() + self.pong_wait;
        loop {
            let read = tokio::select! {
                biased;
                () = closer.cancelled() => return InboundExit::LocalClose,
                read = tokio::time::timeout_at(deadline, stream.next()) => read,
            };
            let frame = match read {
                Err(_) => return InboundExit::ReadTimeout,
                Ok(None) => return InboundExit::StreamEnded,
                Ok(Some(Err(e))) => return InboundExit::ReadError(e),
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                Frame::Text(payload) => {
                    if self.handle_text(payload).await.is_err() {
                        return InboundExit::HubStopped;
                    }
                }
                Frame::Pong(_) => {
                    deadline = Instant::now() + self.pong_wait;
                    trace!(conn_id = %self.id, "pong");
                }
                Frame::Close(code) => return InboundExit::PeerClosed(code),
                Frame::Binary(_) | Frame::Ping(_) => {
                    trace!(conn_id = %self.id, "ignoring non-text frame");
                }
            }
        }
    }

    async fn handle_text(&self, payload: Payload) -> Result<(), HubError> {
        let position = if self.policy.tracks_positions() {
            parse_position(&payload)
        } else {
            None
        };

        match (self.policy, position) {
            (InboundPolicy::PositionAck, Some(position)) => {
                self.record(position);
                match PositionAck::new(self.id.clone(), position).to_json() {
                    Ok(ack) => {
                        self.hub
                            .broadcast(BroadcastEnvelope::to_one(ack, self.id.clone()))
                            .await
                    }
                    Err(e) => {
                        warn!(conn_id = %self.id, error = %e, "failed to encode ack");
                        Ok(())
                    }
                }
            }
            (_, Some(position)) => {
                self.record(position);
                self.relay(payload).await
            }
            (_, None) => self.relay(payload).await,
        }
    }

    fn record(&self, position: Position) {
        if let Some(world) = &self.world {
            world.update_position(&self.id, position);
            counter!(RELAY_POSITION_UPDATES_TOTAL).increment(1);
        }
    }

    async fn relay(&self, payload: Payload) -> Result<(), HubError> {
        let envelope = match self.sender_policy {
            SenderPolicy::Exclude => BroadcastEnvelope::from_sender(payload, self.id.clone()),
            SenderPolicy::Include => BroadcastEnvelope::to_everyone(payload),
        };
        self.hub.broadcast(envelope).await
    }
}

struct Outbound {
    id: ConnectionId,
    write_wait: Duration,
    ping_period: Duration,
}

impl Outbound {
    async fn run<K: FrameSink>(
        self,
        mut sink: K,
        mut mailbox: mpsc::Receiver<Payload>,
        closer: CancellationToken,
    ) -> OutboundExit {
        let exit = self.write_loop(&mut sink, &mut mailbox, &closer).await;
        closer.cancel();
        if tokio::time::timeout(self.write_wait, sink.close()).await.is_err() {
            debug!(conn_id = %self.id, "transport close timed out");
        }
        debug!(conn_id = %self.id, reason = ?exit, "outbound pump stopped");
        exit
    }

    async fn write_loop<K: FrameSink>(
        &self,
        sink: &mut K,
        mailbox: &mut mpsc::Receiver<Payload>,
        closer: &CancellationToken,
    ) -> OutboundExit {
        let period = self.ping_period.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = closer.cancelled() => return OutboundExit::LocalClose,
                item = mailbox.recv() => match item {
                    Some(payload) => {
                        if let Err(e) = self.write(sink, Frame::Text(payload)).await {
                            return OutboundExit::WriteFailed(e);
                        }
                    }
                    None => {
                        if let Err(e) = self.write(sink, Frame::Close(None)).await {
                            debug!(conn_id = %self.id, error = %e, "close frame not written");
                        }
                        return OutboundExit::MailboxClosed;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.write(sink, Frame::Ping(Bytes::new())).await {
                        return OutboundExit::WriteFailed(e);
                    }
                }
            }
        }
    }

    async fn write<K: FrameSink>(&self, sink: &mut K, frame: Frame) -> Result<(), TransportError> {
        match tokio::time::timeout(self.write_wait, sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.write_wait)),
        }
    }
}
