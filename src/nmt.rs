//! Network management command sender.

use crate::frame::{Frame, NmtCommand, NmtState};
use crate::transport::AsyncCanSender;

/// Sends DS-301 network management commands. Holds no response state; NMT
/// has no confirmation frame, only the heartbeat/boot-up side effect on the
/// target node(s).
#[derive(Debug)]
pub struct NmtMaster<S: AsyncCanSender> {
    sender: S,
}

impl<S: AsyncCanSender> NmtMaster<S> {
    /// Build a master over a sender.
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    /// Send a command to a single node.
    pub async fn send(&mut self, node_id: u8, cmd: NmtCommand) -> Result<(), Frame> {
        self.sender.send(cmd.to_frame(node_id)).await
    }

    /// Send a command to all nodes (node id 0 in the wire format).
    pub async fn broadcast(&mut self, cmd: NmtCommand) -> Result<(), Frame> {
        self.sender.send(cmd.to_frame(0)).await
    }

    /// Convenience: move `node_id` to Operational.
    pub async fn start(&mut self, node_id: u8) -> Result<(), Frame> {
        self.send(node_id, NmtCommand::Start).await
    }

    /// Convenience: move `node_id` to Stopped.
    pub async fn stop(&mut self, node_id: u8) -> Result<(), Frame> {
        self.send(node_id, NmtCommand::Stop).await
    }

    /// Convenience: move `node_id` to Pre-Operational.
    pub async fn enter_pre_operational(&mut self, node_id: u8) -> Result<(), Frame> {
        self.send(node_id, NmtCommand::EnterPreOperational).await
    }

    /// Convenience: reset the node's application.
    pub async fn reset_node(&mut self, node_id: u8) -> Result<(), Frame> {
        self.send(node_id, NmtCommand::ResetNode).await
    }

    /// Convenience: reset the node's communication layer.
    pub async fn reset_communication(&mut self, node_id: u8) -> Result<(), Frame> {
        self.send(node_id, NmtCommand::ResetCommunication).await
    }
}

/// Given the outgoing command, the state the facade should optimistically
/// record for the target node. `None` means don't change the cached state
/// (the real state will arrive via heartbeat or boot-up instead).
pub fn optimistic_state_after(cmd: NmtCommand) -> Option<NmtState> {
    match cmd {
        NmtCommand::Start => Some(NmtState::Operational),
        NmtCommand::Stop => Some(NmtState::Stopped),
        NmtCommand::EnterPreOperational => Some(NmtState::PreOperational),
        NmtCommand::ResetNode | NmtCommand::ResetCommunication => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::pair;

    #[tokio::test]
    async fn start_sends_expected_frame() {
        let (tx, mut rx) = pair(4);
        let mut master = NmtMaster::new(tx);
        master.start(1).await.unwrap();

        let f = rx.try_recv().unwrap();
        assert_eq!(f.id().raw(), 0x000);
        assert_eq!(f.data(), &[0x01, 0x01]);
    }

    #[tokio::test]
    async fn broadcast_uses_node_zero() {
        let (tx, mut rx) = pair(4);
        let mut master = NmtMaster::new(tx);
        master.broadcast(NmtCommand::Stop).await.unwrap();

        let f = rx.try_recv().unwrap();
        assert_eq!(f.data(), &[0x02, 0x00]);
    }

    #[test]
    fn reset_commands_do_not_set_optimistic_state() {
        assert_eq!(optimistic_state_after(NmtCommand::ResetNode), None);
        assert_eq!(
            optimistic_state_after(NmtCommand::Start),
            Some(NmtState::Operational)
        );
    }
}
