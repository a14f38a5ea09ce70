//! End-to-end scenarios exercising the device facade against literal wire
//! frames, using an in-memory loopback transport in place of real hardware.

use std::time::Duration;

use canopen_client::device::Device;
use canopen_client::frame::{CobId, Frame, NmtState};
use canopen_client::pdo::{PdoConfig, PdoMapping, PdoNumber};
use canopen_client::sdo::ObjectAddress;
use canopen_client::transport::loopback::pair;
use canopen_client::transport::Bus;

/// Builds a device whose outbound frames land on `out_rx` and whose inbound
/// frames are fed in via `in_tx`.
fn harness(
    node_id: u8,
) -> (
    Device<canopen_client::transport::loopback::LoopbackSender>,
    canopen_client::transport::loopback::LoopbackSender,
    canopen_client::transport::loopback::LoopbackReceiver,
) {
    let (out_tx, out_rx) = pair(16);
    let (in_tx, in_rx) = pair(16);
    let bus = Bus::new(in_rx);
    let device = Device::new(node_id, out_tx, &bus).unwrap();
    (device, in_tx, out_rx)
}

#[tokio::test]
async fn s1_nmt_start() {
    let (mut device, _in_tx, mut out_rx) = harness(1);

    device.start().await.unwrap();

    let f = out_rx.recv().await.unwrap();
    assert_eq!(f.id().raw(), 0x000);
    assert_eq!(f.data(), &[0x01, 0x01]);
    assert_eq!(device.nmt_state(), NmtState::Operational);
}

#[tokio::test]
async fn s2_sdo_read_u16() {
    let (mut device, mut in_tx, mut out_rx) = harness(1);

    let responder = tokio::spawn(async move {
        let req = out_rx.recv().await.unwrap();
        assert_eq!(req.id().raw(), 0x601);
        assert_eq!(req.data(), &[0x40, 0x41, 0x60, 0x00, 0, 0, 0, 0]);
        let resp = Frame::new(
            CobId::new(0x581),
            &[0x4B, 0x41, 0x60, 0x00, 0x37, 0x06, 0, 0],
        );
        in_tx.send(resp).await.unwrap();
    });

    let value = device.read_u16(ObjectAddress::new(0x6041, 0)).await.unwrap();
    assert_eq!(value, 0x0637);
    responder.await.unwrap();
}

#[tokio::test]
async fn s3_sdo_write_u8() {
    let (mut device, mut in_tx, mut out_rx) = harness(1);

    let responder = tokio::spawn(async move {
        let req = out_rx.recv().await.unwrap();
        assert_eq!(req.id().raw(), 0x601);
        assert_eq!(req.data(), &[0x2F, 0x40, 0x60, 0x00, 0x0F, 0, 0, 0]);
        let resp = Frame::new(CobId::new(0x581), &[0x60, 0x40, 0x60, 0x00, 0, 0, 0, 0]);
        in_tx.send(resp).await.unwrap();
    });

    device.write_u8(ObjectAddress::new(0x6040, 0), 0x0F).await.unwrap();
    responder.await.unwrap();
}

#[tokio::test]
async fn s4_sdo_abort_propagates_code() {
    let (mut device, mut in_tx, mut out_rx) = harness(1);

    let responder = tokio::spawn(async move {
        let _req = out_rx.recv().await.unwrap();
        let resp = Frame::new(
            CobId::new(0x581),
            &[0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x02, 0x06],
        );
        in_tx.send(resp).await.unwrap();
    });

    let err = device.upload(ObjectAddress::new(0x1000, 0)).await.unwrap_err();
    match err {
        canopen_client::sdo::SdoClientError::ServerAbort { abort_code, .. } => {
            assert_eq!(abort_code.raw(), 0x0602_0000);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    responder.await.unwrap();
}

#[tokio::test]
async fn s5_rpdo1_send() {
    let (mut device, _in_tx, mut out_rx) = harness(1);

    device.install_standard_rpdo(PdoNumber::First, 255).await;
    device.send_rpdo(PdoNumber::First, &[0x01, 20]).await.unwrap();

    let f = out_rx.recv().await.unwrap();
    assert_eq!(f.id().raw(), 0x201);
    assert_eq!(f.data(), &[0x01, 20]);
}

#[tokio::test]
async fn s6_tpdo1_receive() {
    let (mut device, mut in_tx, _out_rx) = harness(1);

    let mut cfg = PdoConfig::new(PdoNumber::First, CobId::new(0x181), 255);
    cfg.add_mapping(PdoMapping::new(0x6041, 0, 16).unwrap()).unwrap();
    device.configure_tpdo(PdoNumber::First, cfg).await;

    in_tx
        .send(Frame::new(CobId::new(0x181), &[0x34, 0x12, 0, 0]))
        .await
        .unwrap();

    let event = device.next_pdo_event().await.unwrap();
    assert_eq!(event.pdo_number, 1);
    assert_eq!(event.cob_id.raw(), 0x181);
}

#[tokio::test]
async fn s7_heartbeat_life() {
    let (mut device, mut in_tx, _out_rx) = harness(3);

    device.enable_heartbeat(Duration::from_millis(200)).await;

    in_tx
        .send(Frame::new(CobId::new(0x703), &[0x05]))
        .await
        .unwrap();

    let received = device.next_heartbeat_event().await.unwrap();
    match received {
        canopen_client::heartbeat::HeartbeatEvent::Received { node_id, state } => {
            assert_eq!(node_id, 3);
            assert_eq!(state, NmtState::Operational);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let timeout_ev = tokio::time::timeout(Duration::from_millis(500), device.next_heartbeat_event())
        .await
        .unwrap()
        .unwrap();
    match timeout_ev {
        canopen_client::heartbeat::HeartbeatEvent::Timeout {
            node_id,
            last_state,
            elapsed_ms,
        } => {
            assert_eq!(node_id, 3);
            assert_eq!(last_state, Some(NmtState::Operational));
            assert!(elapsed_ms >= 200);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn s8_connect_disconnect_lifecycle() {
    let (mut device, _in_tx, _out_rx) = harness(1);
    assert!(device.is_connected());

    device.disconnect().await.unwrap();
    assert!(!device.is_connected());

    device.connect().await.unwrap();
    assert!(device.is_connected());
}
