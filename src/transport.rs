//! The transport boundary: async send/receive traits, a connection
//! lifecycle, a shared sender wrapper, and a fan-out bus that lets many
//! services subscribe to the same inbound frame stream independently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use snafu::Snafu;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::frame::{Frame, ReceivedFrame};

const SUBSCRIBER_CHANNEL_DEPTH: usize = 256;

/// Errors from the connection lifecycle of a concrete transport. The
/// loopback harness in this crate never actually produces these (it is
/// always connected); a hardware driver implementing [`Connection`] is
/// where they'd surface.
#[derive(Debug, Snafu)]
pub enum TransportError {
    /// An operation was attempted while disconnected.
    #[snafu(display("transport is not connected"))]
    NotConnected,
    /// A payload longer than a classic CAN frame can carry was submitted.
    #[snafu(display("payload of {len} bytes exceeds the 8-byte maximum"))]
    PayloadTooLarge {
        /// The rejected length.
        len: usize,
    },
    /// The underlying OS/hardware layer reported a failure.
    #[snafu(display("transport IO error: {source}"))]
    Io {
        /// The underlying error.
        source: std::io::Error,
    },
}

/// The connection lifecycle a concrete transport exposes: connect,
/// disconnect, and a connected flag. Split out from [`AsyncCanSender`] /
/// [`AsyncCanReceiver`] so a transport's send/receive halves can share one
/// underlying connection state.
pub trait Connection: Send {
    /// Establish the underlying connection.
    fn connect(&mut self) -> impl core::future::Future<Output = Result<(), TransportError>> + Send;

    /// Tear down the underlying connection.
    fn disconnect(&mut self)
        -> impl core::future::Future<Output = Result<(), TransportError>> + Send;

    /// Whether the transport currently considers itself connected.
    fn is_connected(&self) -> bool;
}

/// An async CAN frame sender.
///
/// Mirrors the shape of a minimal hardware driver: one fallible send call.
/// Implementations are expected to be cheap to call repeatedly; this crate
/// never holds a sender across an await point other than the send itself.
pub trait AsyncCanSender: Send {
    /// Send a single frame. On failure the frame is handed back so callers
    /// may decide whether to retry.
    fn send(
        &mut self,
        frame: Frame,
    ) -> impl core::future::Future<Output = Result<(), Frame>> + Send;
}

/// An async CAN frame receiver.
pub trait AsyncCanReceiver: Send {
    /// Error type returned when the underlying source is exhausted/closed.
    type Error: core::fmt::Debug + Send;

    /// Non-blocking receive; `None` if nothing is queued right now.
    fn try_recv(&mut self) -> Option<Frame>;

    /// Await the next frame.
    fn recv(&mut self) -> impl core::future::Future<Output = Result<Frame, Self::Error>> + Send;

    /// Drop anything currently queued.
    fn flush(&mut self) {
        while self.try_recv().is_some() {}
    }
}

/// A sender shared by clone across many tasks, serializing access to the
/// single underlying transport behind a mutex.
#[derive(Debug)]
pub struct SharedSender<S: AsyncCanSender> {
    inner: Arc<Mutex<S>>,
}

impl<S: AsyncCanSender> Clone for SharedSender<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: AsyncCanSender> SharedSender<S> {
    /// Wrap a sender for sharing.
    pub fn new(sender: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sender)),
        }
    }
}

impl<S: AsyncCanSender> AsyncCanSender for SharedSender<S> {
    fn send(
        &mut self,
        frame: Frame,
    ) -> impl core::future::Future<Output = Result<(), Frame>> + Send {
        async move {
            let mut inner = self.inner.lock().await;
            inner.send(frame).await
        }
    }
}

impl<S: AsyncCanSender + Connection> Connection for SharedSender<S> {
    fn connect(&mut self) -> impl core::future::Future<Output = Result<(), TransportError>> + Send {
        async move { self.inner.lock().await.connect().await }
    }

    fn disconnect(
        &mut self,
    ) -> impl core::future::Future<Output = Result<(), TransportError>> + Send {
        async move { self.inner.lock().await.disconnect().await }
    }

    fn is_connected(&self) -> bool {
        self.inner.try_lock().map(|g| g.is_connected()).unwrap_or(false)
    }
}

#[derive(Debug)]
struct BusInner {
    senders: Vec<Sender<ReceivedFrame>>,
}

impl BusInner {
    fn create_rx(&mut self) -> Receiver<ReceivedFrame> {
        let (tx, rx) = channel(SUBSCRIBER_CHANNEL_DEPTH);
        self.senders.push(tx);
        rx
    }
}

/// Fans a single upstream receiver out to any number of independent
/// subscriber channels. Each call to [`Bus::subscribe`] gets its own queue,
/// so one slow subscriber never blocks or reorders another's frames. The
/// receive timestamp is stamped once here, at actual reception, and carried
/// to every subscriber as a [`ReceivedFrame`] rather than re-derived at each
/// subscriber's own dequeue time.
#[derive(Debug)]
pub struct Bus {
    _reader_task: JoinHandle<()>,
    inner: Arc<StdMutex<BusInner>>,
}

impl Bus {
    /// Spawn the fan-out reader task over `receiver`.
    pub fn new<R>(mut receiver: R) -> Self
    where
        R: AsyncCanReceiver + 'static,
    {
        let inner = Arc::new(StdMutex::new(BusInner {
            senders: Vec::new(),
        }));
        let inner_clone = inner.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => {
                        let received = ReceivedFrame {
                            frame,
                            timestamp: Instant::now(),
                        };
                        let mut inner = inner_clone.lock().unwrap();
                        inner.senders.retain(|sender| match sender.try_send(received) {
                            Ok(()) => true,
                            Err(TrySendError::Full(_)) => {
                                log::warn!("dropping frame, subscriber channel full");
                                true
                            }
                            Err(TrySendError::Closed(_)) => false,
                        });
                    }
                    Err(e) => {
                        log::error!("transport receive error: {e:?}");
                        return;
                    }
                }
            }
        });
        Self {
            _reader_task: reader_task,
            inner,
        }
    }

    /// Obtain a new, independent subscriber channel.
    pub fn subscribe(&self) -> BusSubscription {
        let rx = self.inner.lock().unwrap().create_rx();
        BusSubscription {
            inner: self.inner.clone(),
            receiver: rx,
        }
    }

    /// Number of currently live subscriber channels. Mainly useful in tests.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().senders.len()
    }
}

/// One consumer's view of the frame stream, delivered by [`Bus`]. Each
/// delivered [`ReceivedFrame`] carries the timestamp [`Bus`] captured at
/// actual reception.
#[derive(Debug)]
pub struct BusSubscription {
    inner: Arc<StdMutex<BusInner>>,
    receiver: Receiver<ReceivedFrame>,
}

impl Clone for BusSubscription {
    fn clone(&self) -> Self {
        let receiver = self.inner.lock().unwrap().create_rx();
        Self {
            inner: self.inner.clone(),
            receiver,
        }
    }
}

/// Error returned when a [`BusSubscription`]'s upstream has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusClosed;

impl BusSubscription {
    /// Drop any frames currently queued on this subscription.
    pub fn flush(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }

    /// Await the next frame delivered to this subscription, with the
    /// timestamp captured at actual reception.
    pub async fn recv(&mut self) -> Result<ReceivedFrame, BusClosed> {
        self.receiver.recv().await.ok_or(BusClosed)
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<ReceivedFrame> {
        self.receiver.try_recv().ok()
    }
}

impl AsyncCanReceiver for BusSubscription {
    type Error = BusClosed;

    fn try_recv(&mut self) -> Option<Frame> {
        self.try_recv().map(|received| received.frame)
    }

    fn recv(&mut self) -> impl core::future::Future<Output = Result<Frame, Self::Error>> + Send {
        async move { self.recv().await.map(|received| received.frame) }
    }
}

/// An in-memory loopback transport for tests: a sender writes directly into
/// a channel a [`Bus`] can be built over.
pub mod loopback {
    use super::*;

    /// The sending half of a loopback pair.
    #[derive(Debug, Clone)]
    pub struct LoopbackSender {
        tx: Sender<Frame>,
        connected: Arc<AtomicBool>,
    }

    impl AsyncCanSender for LoopbackSender {
        fn send(
            &mut self,
            frame: Frame,
        ) -> impl core::future::Future<Output = Result<(), Frame>> + Send {
            let tx = self.tx.clone();
            async move { tx.send(frame).await.map_err(|e| e.0) }
        }
    }

    impl Connection for LoopbackSender {
        fn connect(
            &mut self,
        ) -> impl core::future::Future<Output = Result<(), TransportError>> + Send {
            self.connected.store(true, Ordering::SeqCst);
            async { Ok(()) }
        }

        fn disconnect(
            &mut self,
        ) -> impl core::future::Future<Output = Result<(), TransportError>> + Send {
            self.connected.store(false, Ordering::SeqCst);
            async { Ok(()) }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    /// The receiving half of a loopback pair, consumable by [`Bus::new`].
    #[derive(Debug)]
    pub struct LoopbackReceiver {
        rx: Receiver<Frame>,
        connected: Arc<AtomicBool>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoopbackClosed;

    impl AsyncCanReceiver for LoopbackReceiver {
        type Error = LoopbackClosed;

        fn try_recv(&mut self) -> Option<Frame> {
            self.rx.try_recv().ok()
        }

        fn recv(
            &mut self,
        ) -> impl core::future::Future<Output = Result<Frame, Self::Error>> + Send {
            async move { self.rx.recv().await.ok_or(LoopbackClosed) }
        }
    }

    impl Connection for LoopbackReceiver {
        fn connect(
            &mut self,
        ) -> impl core::future::Future<Output = Result<(), TransportError>> + Send {
            self.connected.store(true, Ordering::SeqCst);
            async { Ok(()) }
        }

        fn disconnect(
            &mut self,
        ) -> impl core::future::Future<Output = Result<(), TransportError>> + Send {
            self.connected.store(false, Ordering::SeqCst);
            async { Ok(()) }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    /// Build a connected sender/receiver pair with the given queue depth.
    /// Both halves start connected and share one connection flag, so
    /// disconnecting either is visible from the other.
    pub fn pair(depth: usize) -> (LoopbackSender, LoopbackReceiver) {
        let (tx, rx) = channel(depth);
        let connected = Arc::new(AtomicBool::new(true));
        (
            LoopbackSender {
                tx,
                connected: connected.clone(),
            },
            LoopbackReceiver { rx, connected },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::pair;
    use super::*;
    use crate::frame::CobId;

    #[tokio::test]
    async fn bus_fans_out_to_independent_subscribers() {
        let (mut tx, rx) = pair(8);
        let bus = Bus::new(rx);

        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let frame = Frame::new(CobId::new(0x100), &[1, 2, 3]);
        tx.send(frame).await.unwrap();

        assert_eq!(a.recv().await.unwrap().frame, frame);
        assert_eq!(b.recv().await.unwrap().frame, frame);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let (mut tx, rx) = pair(8);
        let bus = Bus::new(rx);

        let a = bus.subscribe();
        let mut b = bus.subscribe();
        drop(a);

        tx.send(Frame::new(CobId::new(0x100), &[9])).await.unwrap();
        let _ = b.recv().await.unwrap();

        // Give the reader task a moment to prune the closed channel.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn loopback_pair_starts_connected_and_shares_disconnect() {
        let (mut tx, rx) = pair(8);
        assert!(tx.is_connected());
        assert!(rx.is_connected());

        tx.disconnect().await.unwrap();
        assert!(!tx.is_connected());
        assert!(!rx.is_connected());

        tx.connect().await.unwrap();
        assert!(tx.is_connected());
        assert!(rx.is_connected());
    }

    #[tokio::test]
    async fn shared_sender_clones_serialize_through_one_lock() {
        let (tx, mut rx) = pair(8);
        let shared = SharedSender::new(tx);

        let mut s1 = shared.clone();
        let mut s2 = shared.clone();
        s1.send(Frame::new(CobId::new(0x1), &[1])).await.unwrap();
        s2.send(Frame::new(CobId::new(0x2), &[2])).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().id().raw(), 0x1);
        assert_eq!(rx.recv().await.unwrap().id().raw(), 0x2);
    }
}
