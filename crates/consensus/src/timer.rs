//! Round timer for the consensus service.
//!
//! The state machine only ever needs one pending timer: every
//! [`Action::SetTimer`](crate::state_machine::Action::SetTimer) replaces the
//! previous one. A fired timer is delivered as [`Event::Timer`] carrying the
//! epoch it was armed for, so a timer that races a view change is ignored by
//! the state machine.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::context::Epoch;
use crate::state_machine::Event;

pub struct RoundTimer {
    current: Option<(Epoch, JoinHandle<()>)>,
    event_tx: mpsc::Sender<Event>,
}

impl RoundTimer {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            current: None,
            event_tx,
        }
    }

    /// Arms the timer, cancelling any pending one.
    pub fn set(&mut self, epoch: Epoch, duration: Duration) {
        self.cancel();

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!("Round timer fired for epoch {}", epoch);
            // Receiver gone means the service stopped.
            let _ = event_tx.send(Event::Timer { epoch }).await;
        });

        self.current = Some((epoch, handle));
        debug!("Round timer set for epoch {} in {:?}", epoch, duration);
    }

    pub fn cancel(&mut self) {
        if let Some((epoch, handle)) = self.current.take() {
            handle.abort();
            trace!("Round timer for epoch {} cancelled", epoch);
        }
    }

    pub fn armed_for(&self) -> Option<Epoch> {
        self.current
            .as_ref()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(epoch, _)| *epoch)
    }
}

impl Drop for RoundTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
