//! Periodic SYNC frame producer.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::frame::Sync;
use crate::transport::AsyncCanSender;

/// Drives a periodic SYNC frame on a background task. A send failure is
/// logged and does not stop the timer; only [`SyncProducer::stop`] or
/// dropping the producer does that.
#[derive(Debug)]
pub struct SyncProducer {
    task: Option<JoinHandle<()>>,
}

impl SyncProducer {
    /// Construct an idle producer. Call [`SyncProducer::start`] to begin
    /// sending.
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Start sending SYNC frames every `period` on the given sender. If a
    /// counter byte should be carried, it cycles through `1..=240` and resets
    /// to 0 on the next start. Starting while already running restarts from
    /// counter 0.
    pub fn start<S>(&mut self, mut sender: S, period: Duration, use_counter: bool)
    where
        S: AsyncCanSender + 'static,
    {
        self.stop();
        let task = tokio::spawn(async move {
            let mut counter: u8 = 0;
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let frame = if use_counter {
                    counter = if counter >= 240 { 1 } else { counter + 1 };
                    Sync {
                        counter: Some(counter),
                    }
                } else {
                    Sync { counter: None }
                }
                .to_frame();
                if let Err(_dropped) = sender.send(frame).await {
                    log::warn!("sync producer: send failed, continuing");
                }
            }
        });
        self.task = Some(task);
    }

    /// Stop sending SYNC frames. A no-op if not running.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// True if the producer currently has a running timer task.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Default for SyncProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SyncProducer {
    fn drop(&mut self) {
        self.stop();
    }
}
