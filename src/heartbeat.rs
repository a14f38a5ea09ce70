//! Per-node heartbeat deadline watchdog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::frame::{Heartbeat as HeartbeatFrame, NmtState};
use crate::transport::BusSubscription;

/// Default interval of the background check loop.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct Watch {
    timeout: Duration,
    last_state: Option<NmtState>,
    last_rx: Option<Instant>,
    alive: bool,
}

impl Watch {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_state: None,
            last_rx: None,
            alive: false,
        }
    }
}

/// An event raised by the heartbeat consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A heartbeat was received for a watched node.
    Received {
        /// The node.
        node_id: u8,
        /// The state it announced.
        state: NmtState,
    },
    /// A watched node's deadline elapsed without a heartbeat.
    Timeout {
        /// The node.
        node_id: u8,
        /// The last state observed before it went quiet.
        last_state: Option<NmtState>,
        /// How long past the deadline we noticed, in milliseconds.
        elapsed_ms: u64,
    },
}

#[derive(Debug, Default)]
struct State {
    watches: HashMap<u8, Watch>,
}

/// Watches a set of nodes for heartbeat liveness, firing received/timeout
/// events on a channel consumers can drain.
#[derive(Debug)]
pub struct HeartbeatConsumer {
    state: Arc<Mutex<State>>,
    events_rx: mpsc::Receiver<HeartbeatEvent>,
    _rx_task: JoinHandle<()>,
    _check_task: JoinHandle<()>,
}

impl HeartbeatConsumer {
    /// Subscribe to `subscription` for inbound heartbeats and start the
    /// background check loop at `check_interval`.
    pub fn new(mut subscription: BusSubscription, check_interval: Duration) -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let (events_tx, events_rx) = mpsc::channel(256);

        let rx_state = state.clone();
        let rx_events_tx = events_tx.clone();
        let rx_task = tokio::spawn(async move {
            loop {
                let received = match subscription.recv().await {
                    Ok(received) => received,
                    Err(_) => return,
                };
                let Some(hb) = HeartbeatFrame::decode(&received.frame) else {
                    log::debug!("dropping frame not decodable as a heartbeat: {:?}", received.frame);
                    continue;
                };
                let mut state = rx_state.lock().await;
                if let Some(watch) = state.watches.get_mut(&hb.node_id) {
                    watch.last_state = Some(hb.state);
                    watch.last_rx = Some(received.timestamp);
                    watch.alive = true;
                    let _ = rx_events_tx
                        .send(HeartbeatEvent::Received {
                            node_id: hb.node_id,
                            state: hb.state,
                        })
                        .await;
                }
            }
        });

        let check_state = state.clone();
        let check_events_tx = events_tx;
        let check_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut state = check_state.lock().await;
                for (node_id, watch) in state.watches.iter_mut() {
                    if !watch.alive {
                        continue;
                    }
                    let Some(last_rx) = watch.last_rx else {
                        continue;
                    };
                    let elapsed = now.duration_since(last_rx);
                    if elapsed > watch.timeout {
                        watch.alive = false;
                        let _ = check_events_tx
                            .send(HeartbeatEvent::Timeout {
                                node_id: *node_id,
                                last_state: watch.last_state,
                                elapsed_ms: elapsed.as_millis() as u64,
                            })
                            .await;
                    }
                }
            }
        });

        Self {
            state,
            events_rx,
            _rx_task: rx_task,
            _check_task: check_task,
        }
    }

    /// Build a consumer using [`DEFAULT_CHECK_INTERVAL`].
    pub fn with_default_interval(subscription: BusSubscription) -> Self {
        Self::new(subscription, DEFAULT_CHECK_INTERVAL)
    }

    /// Start (or replace) a watch on `node_id` with the given deadline.
    pub async fn monitor(&self, node_id: u8, timeout: Duration) {
        let mut state = self.state.lock().await;
        state.watches.insert(node_id, Watch::new(timeout));
    }

    /// Stop watching `node_id`.
    pub async fn stop(&self, node_id: u8) {
        let mut state = self.state.lock().await;
        state.watches.remove(&node_id);
    }

    /// True if the node currently has an armed, alive watch.
    pub async fn is_alive(&self, node_id: u8) -> bool {
        self.state
            .lock()
            .await
            .watches
            .get(&node_id)
            .is_some_and(|w| w.alive)
    }

    /// Await the next heartbeat event.
    pub async fn next_event(&mut self) -> Option<HeartbeatEvent> {
        self.events_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CobId, Frame};
    use crate::transport::loopback::pair;
    use crate::transport::Bus;

    #[tokio::test]
    async fn fires_one_timeout_then_rearms_on_next_heartbeat() {
        let (mut tx, rx) = pair(8);
        let bus = Bus::new(rx);
        let mut consumer = HeartbeatConsumer::new(bus.subscribe(), Duration::from_millis(20));
        consumer.monitor(3, Duration::from_millis(60)).await;

        tx.send(Frame::new(CobId::new(0x703), &[0x05])).await.unwrap();
        let ev = consumer.next_event().await.unwrap();
        assert_eq!(
            ev,
            HeartbeatEvent::Received {
                node_id: 3,
                state: NmtState::Operational
            }
        );
        assert!(consumer.is_alive(3).await);

        // Let it go quiet past the 60ms deadline.
        let ev = tokio::time::timeout(Duration::from_millis(500), consumer.next_event())
            .await
            .unwrap()
            .unwrap();
        match ev {
            HeartbeatEvent::Timeout {
                node_id,
                last_state,
                elapsed_ms,
            } => {
                assert_eq!(node_id, 3);
                assert_eq!(last_state, Some(NmtState::Operational));
                assert!(elapsed_ms >= 60);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!consumer.is_alive(3).await);

        // Re-arm with another heartbeat.
        tx.send(Frame::new(CobId::new(0x703), &[0x7F])).await.unwrap();
        let ev = consumer.next_event().await.unwrap();
        assert_eq!(
            ev,
            HeartbeatEvent::Received {
                node_id: 3,
                state: NmtState::PreOperational
            }
        );
        assert!(consumer.is_alive(3).await);
    }

    #[tokio::test]
    async fn non_heartbeat_frames_are_logged_and_dropped() {
        let _ = env_logger::try_init();
        let (mut tx, rx) = pair(8);
        let bus = Bus::new(rx);
        let mut consumer = HeartbeatConsumer::new(bus.subscribe(), Duration::from_millis(20));
        consumer.monitor(3, Duration::from_millis(60)).await;

        // Outside the heartbeat COB-ID range; decode fails and should be logged.
        tx.send(Frame::new(CobId::new(0x080), &[])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(consumer.events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unwatched_node_heartbeats_are_ignored() {
        let (mut tx, rx) = pair(8);
        let bus = Bus::new(rx);
        let mut consumer = HeartbeatConsumer::new(bus.subscribe(), Duration::from_millis(20));

        tx.send(Frame::new(CobId::new(0x705), &[0x05])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(consumer.events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_removes_the_watch() {
        let (mut tx, rx) = pair(8);
        let bus = Bus::new(rx);
        let consumer = HeartbeatConsumer::new(bus.subscribe(), Duration::from_millis(20));
        consumer.monitor(1, Duration::from_millis(50)).await;
        consumer.stop(1).await;

        tx.send(Frame::new(CobId::new(0x701), &[0x05])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!consumer.is_alive(1).await);
    }
}
