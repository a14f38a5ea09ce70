//! Expedited SDO client: correlates requests with responses, enforces
//! single-flight access per object, and races a deadline against the
//! response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::codec::{AbortCode, ObjectAddress, SdoRequest, SdoResponse, RESPONSE_BASE};
use super::error::{
    CancelledSnafu, InvalidUtf8Snafu, RequestInFlightSnafu, SdoClientError, SendFailedSnafu,
    ServerAbortSnafu, TimeoutSnafu, UnexpectedResponseKindSnafu, UnsupportedLengthSnafu,
};
use crate::transport::{AsyncCanSender, BusSubscription};

/// Default deadline for a single SDO exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

type PendingTable = Arc<Mutex<HashMap<ObjectAddress, oneshot::Sender<SdoResponse>>>>;

/// A client performing expedited SDO upload/download against one server
/// node. Different objects may have requests in flight concurrently; the
/// same `(index, sub)` may not.
#[derive(Debug)]
pub struct SdoClient<S: AsyncCanSender> {
    node_id: u8,
    sender: S,
    pending: PendingTable,
    timeout: Duration,
    _dispatch_task: JoinHandle<()>,
}

impl<S: AsyncCanSender + 'static> SdoClient<S> {
    /// Build a client for `node_id`, sending through `sender` and consuming
    /// responses from `subscription`. Uses [`DEFAULT_TIMEOUT`].
    pub fn new(node_id: u8, sender: S, subscription: BusSubscription) -> Self {
        Self::with_timeout(node_id, sender, subscription, DEFAULT_TIMEOUT)
    }

    /// Build a client with an explicit response deadline.
    pub fn with_timeout(
        node_id: u8,
        sender: S,
        mut subscription: BusSubscription,
        timeout: Duration,
    ) -> Self {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();
        let resp_id = RESPONSE_BASE + node_id as u16;
        let dispatch_task = tokio::spawn(async move {
            loop {
                let frame = match subscription.recv().await {
                    Ok(received) => received.frame,
                    Err(_) => return,
                };
                if frame.id().raw() != resp_id {
                    continue;
                }
                let response = match SdoResponse::decode(&frame) {
                    Ok(r) => r,
                    Err(e) => {
                        log::debug!("dropping malformed SDO response: {e}");
                        continue;
                    }
                };
                let addr = match response {
                    SdoResponse::ConfirmDownload { addr } => addr,
                    SdoResponse::ConfirmUpload { addr, .. } => addr,
                    SdoResponse::Abort { addr, .. } => addr,
                };
                let mut pending = pending_clone.lock().await;
                if let Some(tx) = pending.remove(&addr) {
                    let _ = tx.send(response);
                }
            }
        });
        Self {
            node_id,
            sender,
            pending,
            timeout,
            _dispatch_task: dispatch_task,
        }
    }

    async fn register(&self, addr: ObjectAddress) -> Result<oneshot::Receiver<SdoResponse>, SdoClientError> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&addr) {
            return RequestInFlightSnafu { addr }.fail();
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(addr, tx);
        Ok(rx)
    }

    async fn unregister(&self, addr: ObjectAddress) {
        self.pending.lock().await.remove(&addr);
    }

    /// Race the response against the deadline and, if given, a caller
    /// cancellation signal. Cancellation abandons the wait immediately and
    /// removes the pending entry without sending an Abort SDO; a timeout
    /// does send one (see `send_abort_on_timeout`).
    async fn wait_for(
        &mut self,
        addr: ObjectAddress,
        rx: oneshot::Receiver<SdoResponse>,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<SdoResponse, SdoClientError> {
        let Some(cancel) = cancel else {
            return self.wait_for_deadline(addr, rx).await;
        };
        tokio::pin!(cancel);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        tokio::select! {
            response = rx => match response {
                Ok(response) => Ok(response),
                Err(_) => Err(SdoClientError::Timeout { addr, elapsed: self.timeout }),
            },
            _ = &mut deadline => {
                self.unregister(addr).await;
                self.send_abort_on_timeout(addr).await;
                TimeoutSnafu { addr, elapsed: self.timeout }.fail()
            }
            _ = &mut cancel => {
                self.unregister(addr).await;
                CancelledSnafu { addr }.fail()
            }
        }
    }

    async fn wait_for_deadline(
        &mut self,
        addr: ObjectAddress,
        rx: oneshot::Receiver<SdoResponse>,
    ) -> Result<SdoResponse, SdoClientError> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                // Dispatch task shut down; treat as a timeout.
                Err(SdoClientError::Timeout {
                    addr,
                    elapsed: self.timeout,
                })
            }
            Err(_) => {
                self.unregister(addr).await;
                self.send_abort_on_timeout(addr).await;
                TimeoutSnafu {
                    addr,
                    elapsed: self.timeout,
                }
                .fail()
            }
        }
    }

    async fn send_abort_on_timeout(&mut self, addr: ObjectAddress) {
        let req = SdoRequest::abort(addr, AbortCode::SdoProtocolTimeout);
        if self.sender.send(req.to_frame(self.node_id)).await.is_err() {
            log::debug!("best-effort abort-on-timeout send failed for {addr:?}");
        }
    }

    /// Read an object. Returns the 1-4 valid data bytes the server sent.
    pub async fn upload(&mut self, addr: ObjectAddress) -> Result<Vec<u8>, SdoClientError> {
        self.upload_cancellable(addr, None).await
    }

    /// Read an object, abandoning the wait if `cancel` fires before the
    /// server responds or the deadline elapses. No Abort SDO is sent on
    /// cancellation.
    pub async fn upload_cancellable(
        &mut self,
        addr: ObjectAddress,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<Vec<u8>, SdoClientError> {
        let rx = self.register(addr).await?;
        let req = SdoRequest::upload(addr);
        if self.sender.send(req.to_frame(self.node_id)).await.is_err() {
            self.unregister(addr).await;
            return SendFailedSnafu.fail();
        }
        match self.wait_for(addr, rx, cancel).await? {
            SdoResponse::ConfirmUpload { len, data, .. } => {
                Ok(data[..len as usize].to_vec())
            }
            SdoResponse::Abort { addr, abort_code } => {
                ServerAbortSnafu { addr, abort_code }.fail()
            }
            SdoResponse::ConfirmDownload { addr } => {
                UnexpectedResponseKindSnafu { addr }.fail()
            }
        }
    }

    /// Write 1-4 bytes to an object.
    pub async fn download(&mut self, addr: ObjectAddress, data: &[u8]) -> Result<(), SdoClientError> {
        self.download_cancellable(addr, data, None).await
    }

    /// Write 1-4 bytes to an object, abandoning the wait if `cancel` fires
    /// before the server responds or the deadline elapses. No Abort SDO is
    /// sent on cancellation.
    pub async fn download_cancellable(
        &mut self,
        addr: ObjectAddress,
        data: &[u8],
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<(), SdoClientError> {
        if data.is_empty() || data.len() > 4 {
            return UnsupportedLengthSnafu { len: data.len() }.fail();
        }
        let rx = self.register(addr).await?;
        let req =
            SdoRequest::download(addr, data).map_err(|_| SdoClientError::UnsupportedLength {
                len: data.len(),
            })?;
        if self.sender.send(req.to_frame(self.node_id)).await.is_err() {
            self.unregister(addr).await;
            return SendFailedSnafu.fail();
        }
        match self.wait_for(addr, rx, cancel).await? {
            SdoResponse::ConfirmDownload { .. } => Ok(()),
            SdoResponse::Abort { addr, abort_code } => {
                ServerAbortSnafu { addr, abort_code }.fail()
            }
            SdoResponse::ConfirmUpload { addr, .. } => {
                UnexpectedResponseKindSnafu { addr }.fail()
            }
        }
    }

    /// Read an unsigned 8-bit value.
    pub async fn read_u8(&mut self, addr: ObjectAddress) -> Result<u8, SdoClientError> {
        let bytes = self.upload(addr).await?;
        Ok(*bytes.first().unwrap_or(&0))
    }

    /// Read an unsigned 16-bit value (zero-extended if the server replied short).
    pub async fn read_u16(&mut self, addr: ObjectAddress) -> Result<u16, SdoClientError> {
        let bytes = self.upload(addr).await?;
        let mut buf = [0u8; 2];
        let n = bytes.len().min(2);
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(u16::from_le_bytes(buf))
    }

    /// Read an unsigned 32-bit value.
    pub async fn read_u32(&mut self, addr: ObjectAddress) -> Result<u32, SdoClientError> {
        let bytes = self.upload(addr).await?;
        let mut buf = [0u8; 4];
        let n = bytes.len().min(4);
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a signed 16-bit value.
    pub async fn read_i16(&mut self, addr: ObjectAddress) -> Result<i16, SdoClientError> {
        Ok(self.read_u16(addr).await? as i16)
    }

    /// Read a signed 32-bit value.
    pub async fn read_i32(&mut self, addr: ObjectAddress) -> Result<i32, SdoClientError> {
        Ok(self.read_u32(addr).await? as i32)
    }

    /// Write an unsigned 8-bit value.
    pub async fn write_u8(&mut self, addr: ObjectAddress, value: u8) -> Result<(), SdoClientError> {
        self.download(addr, &[value]).await
    }

    /// Write an unsigned 16-bit value.
    pub async fn write_u16(&mut self, addr: ObjectAddress, value: u16) -> Result<(), SdoClientError> {
        self.download(addr, &value.to_le_bytes()).await
    }

    /// Write an unsigned 32-bit value.
    pub async fn write_u32(&mut self, addr: ObjectAddress, value: u32) -> Result<(), SdoClientError> {
        self.download(addr, &value.to_le_bytes()).await
    }

    /// Write a signed 16-bit value.
    pub async fn write_i16(&mut self, addr: ObjectAddress, value: i16) -> Result<(), SdoClientError> {
        self.write_u16(addr, value as u16).await
    }

    /// Write a signed 32-bit value.
    pub async fn write_i32(&mut self, addr: ObjectAddress, value: i32) -> Result<(), SdoClientError> {
        self.write_u32(addr, value as u32).await
    }

    /// Read a UTF-8 string object (trailing NUL bytes, if any, are trimmed).
    pub async fn read_utf8(&mut self, addr: ObjectAddress) -> Result<String, SdoClientError> {
        let bytes = self.upload(addr).await?;
        let trimmed: Vec<u8> = bytes.into_iter().take_while(|&b| b != 0).collect();
        String::from_utf8(trimmed).map_err(|_| InvalidUtf8Snafu { addr }.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CobId, Frame};
    use crate::transport::loopback::pair;
    use crate::transport::{AsyncCanReceiver, Bus};

    #[tokio::test]
    async fn round_trip_download_then_upload() {
        let (req_tx, mut req_rx) = pair(8);
        let (resp_tx, resp_rx) = pair(8);
        let bus = Bus::new(resp_rx);
        let mut client = SdoClient::with_timeout(1, req_tx, bus.subscribe(), Duration::from_millis(200));

        let addr = ObjectAddress::new(0x2000, 0);
        let write_task = tokio::spawn({
            let mut resp_tx = resp_tx.clone();
            async move {
                let req_frame = req_rx.recv().await.unwrap();
                assert_eq!(req_frame.id().raw(), 0x601);
                let resp = Frame::new(CobId::new(0x581), &[0x60, 0x00, 0x20, 0x00, 0, 0, 0, 0]);
                resp_tx.send(resp).await.unwrap();
                req_rx
            }
        });
        client.download(addr, &[0x0F]).await.unwrap();
        let mut req_rx = write_task.await.unwrap();

        tokio::spawn({
            let mut resp_tx = resp_tx.clone();
            async move {
                let _req = req_rx.recv().await.unwrap();
                let resp = Frame::new(
                    CobId::new(0x581),
                    &[0x4F, 0x00, 0x20, 0x00, 0x0F, 0, 0, 0],
                );
                resp_tx.send(resp).await.unwrap();
            }
        });
        let data = client.upload(addr).await.unwrap();
        assert_eq!(data, vec![0x0F]);
    }

    #[tokio::test]
    async fn single_flight_rejects_concurrent_same_object() {
        let (req_tx, _req_rx) = pair(8);
        let (_resp_tx, resp_rx) = pair(8);
        let bus = Bus::new(resp_rx);
        let mut client = SdoClient::with_timeout(1, req_tx, bus.subscribe(), Duration::from_millis(50));

        let addr = ObjectAddress::new(0x1000, 0);
        let rx = client.register(addr).await.unwrap();
        let err = client.register(addr).await.unwrap_err();
        assert_eq!(err, SdoClientError::RequestInFlight { addr });
        drop(rx);
    }

    #[tokio::test]
    async fn upload_times_out_and_clears_pending_table() {
        let (req_tx, _req_rx) = pair(8);
        let (_resp_tx, resp_rx) = pair(8);
        let bus = Bus::new(resp_rx);
        let mut client = SdoClient::with_timeout(1, req_tx, bus.subscribe(), Duration::from_millis(30));

        let addr = ObjectAddress::new(0x1000, 0);
        let err = client.upload(addr).await.unwrap_err();
        assert!(matches!(err, SdoClientError::Timeout { .. }));
        assert!(!client.pending.lock().await.contains_key(&addr));
    }

    #[tokio::test]
    async fn abort_response_propagates_code() {
        let (req_tx, mut req_rx) = pair(8);
        let (resp_tx, resp_rx) = pair(8);
        let bus = Bus::new(resp_rx);
        let mut client = SdoClient::with_timeout(1, req_tx, bus.subscribe(), Duration::from_millis(200));

        let addr = ObjectAddress::new(0x1000, 0);
        tokio::spawn(async move {
            let _req = req_rx.recv().await.unwrap();
            let mut resp_tx = resp_tx;
            let resp = Frame::new(
                CobId::new(0x581),
                &[0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x02, 0x06],
            );
            resp_tx.send(resp).await.unwrap();
        });

        let err = client.upload(addr).await.unwrap_err();
        match err {
            SdoClientError::ServerAbort { addr: a, abort_code } => {
                assert_eq!(a, addr);
                assert_eq!(abort_code.raw(), 0x0602_0000);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_abandons_wait_without_sending_abort() {
        let (req_tx, mut req_rx) = pair(8);
        let (_resp_tx, resp_rx) = pair(8);
        let bus = Bus::new(resp_rx);
        let mut client =
            SdoClient::with_timeout(1, req_tx, bus.subscribe(), Duration::from_millis(200));

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let addr = ObjectAddress::new(0x1000, 0);

        let upload = tokio::spawn(async move {
            client
                .upload_cancellable(addr, Some(cancel_rx))
                .await
                .map(|_| client)
        });

        let _req = req_rx.recv().await.unwrap();
        cancel_tx.send(()).unwrap();
        let err = upload.await.unwrap().unwrap_err();
        assert_eq!(err, SdoClientError::Cancelled { addr });

        // No abort frame was sent as a follow-up; the request channel is
        // empty (any message here would be an unexpected Abort SDO).
        assert!(req_rx.try_recv().is_err());
    }
}
