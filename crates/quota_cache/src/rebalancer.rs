// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{Level, event};

use crate::manager::Manager;

/// Handle of a background rebalancing thread. Dropping it stops the thread.
///
/// Created by [`Manager::spawn_rebalancer`]. The thread also stops on its own once the
/// manager is gone.
#[derive(Debug)]
pub struct Rebalancer {
    stop: Option<flume::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Rebalancer {
    pub(crate) fn spawn(manager: Weak<Manager>, interval: Duration) -> std::io::Result<Self> {
        let (stop, stopped) = flume::bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name("quota-cache-rebalancer".to_owned())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(flume::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.rebalance();
                }
                event!(Level::DEBUG, "rebalancer stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

impl Drop for Rebalancer {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            event!(Level::WARN, "rebalancer thread panicked");
        }
    }
}
