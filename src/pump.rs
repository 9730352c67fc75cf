//! Async driver feeding transport events into a [`SatelliteManager`].
//!
//! Adapter and scan events are applied in arrival order by the dispatcher.
//! Each satellite gets its own mailbox task, so one satellite's events stay
//! ordered while different satellites proceed concurrently. Transfer passes
//! run on the blocking pool alongside the mailbox, which keeps a disconnect
//! able to cancel a pass that is mid-read.

use crate::manager::SatelliteManager;
use crate::satellite::SatelliteId;
use crate::transport::TransportEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpStats {
    pub events: u64,
    pub mailboxes: usize,
    pub transfers: u64,
}

struct Mailbox {
    sender: mpsc::UnboundedSender<TransportEvent>,
    task: JoinHandle<u64>,
}

/// Handle to a running pump. Dropping it stops the pump as if
/// [`shutdown`](Self::shutdown) had been called, without waiting.
pub struct EventPump {
    stop: oneshot::Sender<()>,
    dispatcher: JoinHandle<PumpStats>,
}

impl EventPump {
    /// Starts pumping `events` into `manager` on the current tokio runtime.
    pub fn spawn(manager: Arc<SatelliteManager>, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        let (stop, stop_requested) = oneshot::channel();
        let dispatcher = tokio::spawn(dispatch(manager, events, stop_requested));
        Self { stop, dispatcher }
    }

    pub fn is_finished(&self) -> bool {
        self.dispatcher.is_finished()
    }

    /// Waits for the event stream to close and every mailbox to drain.
    pub async fn join(self) -> PumpStats {
        let EventPump { stop, dispatcher } = self;
        let stats = finish(dispatcher).await;
        drop(stop);
        stats
    }

    /// Stops taking new events, lets each mailbox drain what it already
    /// holds, and waits for running transfers. Shut the manager down first
    /// to cancel those transfers instead of waiting them out.
    pub async fn shutdown(self) -> PumpStats {
        let EventPump { stop, dispatcher } = self;
        let _ = stop.send(());
        finish(dispatcher).await
    }
}

async fn finish(dispatcher: JoinHandle<PumpStats>) -> PumpStats {
    match dispatcher.await {
        Ok(stats) => stats,
        Err(e) => {
            error!("Event dispatcher failed: {}", e);
            PumpStats::default()
        }
    }
}

async fn dispatch(
    manager: Arc<SatelliteManager>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut stop_requested: oneshot::Receiver<()>,
) -> PumpStats {
    let mut stats = PumpStats::default();
    let mut mailboxes: HashMap<SatelliteId, Mailbox> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = &mut stop_requested => {
                debug!("Event pump stop requested");
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    debug!("Transport event stream closed");
                    break;
                }
            },
        };
        stats.events += 1;

        match event.satellite_id().cloned() {
            Some(id) => {
                let mailbox = mailboxes
                    .entry(id.clone())
                    .or_insert_with(|| open_mailbox(Arc::clone(&manager), id.clone()));
                if mailbox.sender.send(event).is_err() {
                    error!(satellite = %id, "Satellite mailbox closed; event dropped");
                }
            }
            None => {
                let manager = Arc::clone(&manager);
                if let Err(e) = tokio::task::spawn_blocking(move || manager.handle_event(event)).await {
                    error!("Adapter event handling failed: {}", e);
                }
            }
        }
    }

    stats.mailboxes = mailboxes.len();
    for (id, mailbox) in mailboxes {
        drop(mailbox.sender);
        match mailbox.task.await {
            Ok(transfers) => stats.transfers += transfers,
            Err(e) => error!(satellite = %id, "Mailbox task failed: {}", e),
        }
    }

    info!(
        events = stats.events,
        mailboxes = stats.mailboxes,
        transfers = stats.transfers,
        "Event pump stopped"
    );
    stats
}

fn open_mailbox(manager: Arc<SatelliteManager>, id: SatelliteId) -> Mailbox {
    let (sender, mut receiver) = mpsc::unbounded_channel::<TransportEvent>();
    debug!(satellite = %id, "Opening mailbox");

    let task = tokio::spawn(async move {
        let mut transfers = JoinSet::new();
        let mut started = 0u64;

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let processing = Arc::clone(&manager);
                    match tokio::task::spawn_blocking(move || processing.process_event(event)).await {
                        Ok(Some(job)) => {
                            started += 1;
                            let running = Arc::clone(&manager);
                            transfers.spawn_blocking(move || running.run_transfer(job));
                        }
                        Ok(None) => {}
                        Err(e) => error!(satellite = %id, "Event handling failed: {}", e),
                    }
                }
                Some(finished) = transfers.join_next(), if !transfers.is_empty() => {
                    if let Err(e) = finished {
                        error!(satellite = %id, "Transfer task failed: {}", e);
                    }
                }
            }
        }

        while let Some(finished) = transfers.join_next().await {
            if let Err(e) = finished {
                error!(satellite = %id, "Transfer task failed: {}", e);
            }
        }
        started
    });

    Mailbox { sender, task }
}
