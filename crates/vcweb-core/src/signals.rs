//! Signal delivery.
//!
//! A [`SignalBus`] fans committed signals out to registered
//! [`SignalListener`]s and, when configured, to a `tokio` broadcast
//! channel. A failing listener is logged and skipped; it never affects the
//! transition that raised the signal or the other listeners.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use vcweb_types::Signal;

/// Default capacity of the signal broadcast channel.
///
/// A subscriber that falls further behind receives
/// [`broadcast::error::RecvError::Lagged`] and skips ahead.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// A listener failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

/// Receives committed signals.
pub trait SignalListener: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle one signal.
    ///
    /// # Errors
    ///
    /// Any error is logged by the bus and otherwise ignored.
    fn on_signal(&self, signal: &Signal) -> Result<(), ListenerError>;
}

/// Outcome of dispatching one signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that handled the signal.
    pub delivered: usize,
    /// Listeners that returned an error.
    pub failed: usize,
    /// Broadcast receivers that got the signal.
    pub broadcast: usize,
}

/// Registered listeners plus an optional broadcast channel.
pub struct SignalBus {
    listeners: RwLock<Vec<Arc<dyn SignalListener>>>,
    tx: Option<broadcast::Sender<Signal>>,
}

impl SignalBus {
    /// A bus without a broadcast channel.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            tx: None,
        }
    }

    /// A bus that also publishes every signal on a broadcast channel.
    pub fn with_channel(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            tx: Some(tx),
        }
    }

    /// Subscribe to the broadcast channel, if there is one.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Signal>> {
        self.tx.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Add a listener. Listeners are called in registration order.
    pub fn register(&self, listener: Arc<dyn SignalListener>) {
        debug!(listener = listener.name(), "Registered signal listener");
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `signal` to every listener and the broadcast channel.
    pub fn dispatch(&self, signal: &Signal) -> DispatchReport {
        let listeners: Vec<Arc<dyn SignalListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut report = DispatchReport::default();
        for listener in listeners {
            match listener.on_signal(signal) {
                Ok(()) => report.delivered = report.delivered.saturating_add(1),
                Err(e) => {
                    report.failed = report.failed.saturating_add(1);
                    warn!(
                        listener = listener.name(),
                        signal = signal.name(),
                        experiment_id = %signal.experiment(),
                        error = %e,
                        "Signal listener failed"
                    );
                }
            }
        }
        // send only fails when nobody is subscribed.
        if let Some(tx) = &self.tx {
            report.broadcast = tx.send(signal.clone()).unwrap_or(0);
        }
        report
    }

    /// Deliver signals in order.
    pub fn dispatch_all(&self, signals: &[Signal]) -> DispatchReport {
        signals.iter().fold(DispatchReport::default(), |acc, s| {
            let r = self.dispatch(s);
            DispatchReport {
                delivered: acc.delivered.saturating_add(r.delivered),
                failed: acc.failed.saturating_add(r.failed),
                broadcast: acc.broadcast.saturating_add(r.broadcast),
            }
        })
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignalBus")
            .field("listeners", &self.listener_count())
            .field("broadcast", &self.tx.is_some())
            .finish()
    }
}

/// Writes every signal to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl SignalListener for LoggingListener {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn on_signal(&self, signal: &Signal) -> Result<(), ListenerError> {
        match signal {
            Signal::RoundStarted(s) => info!(
                experiment_id = %s.experiment,
                round = s.sequence_number,
                repetition = s.repeating_round_sequence_number,
                round_type = s.round_type.label(),
                "Round started"
            ),
            Signal::RoundEnded(s) => info!(
                experiment_id = %s.experiment,
                round = s.sequence_number,
                repetition = s.repeating_round_sequence_number,
                "Round ended"
            ),
            Signal::ParticipantAdded(s) => debug!(
                experiment_id = %s.experiment,
                participant = %s.participant,
                group = s.group_number,
                participant_number = s.participant_number,
                "Participant added"
            ),
        }
        Ok(())
    }
}
