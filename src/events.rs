//! Timing notifications for registry operations
//!
//! Every registry call runs inside a [`TimerScope`]. A scope reports
//! [`TimerState::Started`] when it is created, [`TimerState::Lap`] for each
//! completed phase and [`TimerState::Finished`] when it is dropped, so the
//! closing event fires on every exit path.
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::trace;

/// Receives the timing events emitted while talking to a registry
pub trait EventHandler: Send + Sync {
    /// Called for every timer state change
    fn on_timer(&self, event: &TimerEvent);
}

/// The state change a [`TimerEvent`] reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// The timer started
    Started,
    /// A phase of the timed operation completed
    Lap,
    /// The timed operation ended, successfully or not
    Finished,
}

/// A single timing notification
#[derive(Debug, Clone)]
pub struct TimerEvent {
    /// What happened to the timer
    pub state: TimerState,
    /// The name of the timed operation or phase
    pub description: String,
    /// The description of the enclosing timer, for sub-timers
    pub parent: Option<String>,
    /// Wall-clock time of the event
    pub timestamp: DateTime<Utc>,
    /// Time since the timer started
    pub elapsed: Duration,
    /// Time since the previous lap, or since the start when there was none
    pub duration: Duration,
}

/// A running timer that reports its events to an optional [`EventHandler`].
pub struct TimerScope {
    handler: Option<Arc<dyn EventHandler>>,
    description: String,
    parent: Option<String>,
    started: Instant,
    last_lap: Instant,
}

impl fmt::Debug for TimerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScope")
            .field("description", &self.description)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl TimerScope {
    /// Starts a top-level timer
    pub fn new(handler: Option<Arc<dyn EventHandler>>, description: impl Into<String>) -> Self {
        Self::start(handler, description.into(), None)
    }

    /// Starts a timer nested in this one
    pub fn sub_timer(&self, description: impl Into<String>) -> TimerScope {
        Self::start(
            self.handler.clone(),
            description.into(),
            Some(self.description.clone()),
        )
    }

    fn start(
        handler: Option<Arc<dyn EventHandler>>,
        description: String,
        parent: Option<String>,
    ) -> Self {
        let now = Instant::now();
        let scope = TimerScope {
            handler,
            description,
            parent,
            started: now,
            last_lap: now,
        };
        scope.emit(TimerState::Started, Duration::ZERO, Duration::ZERO);
        scope
    }

    /// The name currently reported by this timer
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Ends the current phase and starts the next one under a new name
    pub fn lap(&mut self, next: impl Into<String>) {
        let now = Instant::now();
        self.emit(
            TimerState::Lap,
            now - self.started,
            now - self.last_lap,
        );
        self.last_lap = now;
        self.description = next.into();
    }

    fn emit(&self, state: TimerState, elapsed: Duration, duration: Duration) {
        trace!(
            ?state,
            description = %self.description,
            parent = self.parent.as_deref(),
            ?elapsed,
            ?duration,
            "Timer event"
        );
        if let Some(handler) = &self.handler {
            handler.on_timer(&TimerEvent {
                state,
                description: self.description.clone(),
                parent: self.parent.clone(),
                timestamp: Utc::now(),
                elapsed,
                duration,
            });
        }
    }
}

impl Drop for TimerScope {
    fn drop(&mut self) {
        let now = Instant::now();
        self.emit(
            TimerState::Finished,
            now - self.started,
            now - self.last_lap,
        );
    }
}
