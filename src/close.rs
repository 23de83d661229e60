use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::consumer::WakeHandle;
use crate::event_loop::Event;

/// Receiver lifecycle. Active is entered exactly once on Init; Closing on
/// cancellation, explicit close, or a fatal event-loop error; Closed when the
/// consumer client has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiverState {
    Created = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ReceiverState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReceiverState::Created,
            1 => ReceiverState::Active,
            2 => ReceiverState::Closing,
            _ => ReceiverState::Closed,
        }
    }
}

/// Shutdown state machine. Triggering close wakes the consumer out of a
/// blocking poll and enqueues a Close event carrying its deadline via
/// [`CloseCoordinator::deadline`]; the event loop releases the client and
/// finalizes the state, which observers await through the watch channel.
pub(crate) struct CloseCoordinator {
    state: AtomicU8,
    close_timeout: Duration,
    deadline: Mutex<Option<Instant>>,
    waker: Mutex<Option<Arc<dyn WakeHandle>>>,
    event_tx: SyncSender<Event>,
    closed_tx: watch::Sender<bool>,
}

impl CloseCoordinator {
    pub(crate) fn new(
        close_timeout: Duration,
        event_tx: SyncSender<Event>,
    ) -> (Self, watch::Receiver<bool>) {
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            Self {
                state: AtomicU8::new(ReceiverState::Created as u8),
                close_timeout,
                deadline: Mutex::new(None),
                waker: Mutex::new(None),
                event_tx,
                closed_tx,
            },
            closed_rx,
        )
    }

    pub(crate) fn state(&self) -> ReceiverState {
        ReceiverState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state() == ReceiverState::Active
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.state() >= ReceiverState::Closing
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == ReceiverState::Closed
    }

    /// Init transition; fails silently if close was already requested.
    pub(crate) fn mark_active(&self) {
        let _ = self.state.compare_exchange(
            ReceiverState::Created as u8,
            ReceiverState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Install the client's wake handle once the consumer exists.
    pub(crate) fn install_waker(&self, waker: Arc<dyn WakeHandle>) {
        *self.waker.lock().unwrap() = Some(waker);
    }

    /// Begin shutdown. Idempotent; safe from any thread. The deadline is
    /// recorded before the Close event is sent so the event loop can still
    /// finish the shutdown if the queue rejects the event (it re-checks the
    /// state on every timer tick).
    pub(crate) fn trigger(&self) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= ReceiverState::Closing as u8 {
                return;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    ReceiverState::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        debug!("close triggered");
        *self.deadline.lock().unwrap() = Some(Instant::now() + self.close_timeout);
        if let Some(waker) = self.waker.lock().unwrap().as_ref() {
            waker.wake();
        }
        if self.event_tx.try_send(Event::Close).is_err() {
            warn!("close event could not be enqueued; event loop will notice on its next tick");
        }
    }

    /// Deadline for draining in-progress commits during close.
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
            .lock()
            .unwrap()
            .unwrap_or_else(Instant::now)
    }

    /// Terminal transition: the client is released, observers are notified.
    pub(crate) fn finalize(&self) {
        self.state
            .store(ReceiverState::Closed as u8, Ordering::Release);
        let _ = self.closed_tx.send(true);
    }
}

impl PartialOrd for ReceiverState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReceiverState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}
