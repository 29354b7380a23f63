//! Core state controller implementation
//!
//! Advances one step per tick from the latest sensor readings and the
//! tick timestamp. The controller never reads a clock; timers are deadlines
//! compared against the timestamp it is handed, so tests drive it with
//! synthetic instants.

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::capture::Capture;
use crate::config::ControllerConfig;
use crate::events::DeviceEvent;
use crate::memory::MemoryStore;
use crate::sensors::{CapEdge, SensorReadings, SensorSnapshot, SensorType};
use crate::transfer::{TransferError, TransferJob};

use super::error::DeviceError;

/// The seven states of the bottle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for a gesture
    Idle,
    /// Selector being turned
    Selecting,
    /// Cap open, capturing the selected item
    Recording,
    /// One of the two items captured
    Incomplete,
    /// Both items captured, waiting for the pour gesture
    Ready,
    /// Transfer outstanding
    Transferring,
    /// Fatal failure, only a reset leaves this state
    Error,
}

impl Default for State {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Idle => write!(f, "Idle"),
            State::Selecting => write!(f, "Selecting"),
            State::Recording => write!(f, "Recording"),
            State::Incomplete => write!(f, "Incomplete"),
            State::Ready => write!(f, "Ready"),
            State::Transferring => write!(f, "Transferring"),
            State::Error => write!(f, "Error"),
        }
    }
}

/// Read-only view of the controller, polled by the display and IPC layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub state: State,
    pub selected_sensor: SensorType,
    pub has_audio: bool,
    pub has_color: bool,
    pub can_pour: bool,
    pub transfer_failures: u8,
    /// Readings consumed by the latest tick
    pub sensors: SensorReadings,
}

/// What a tick asks of its caller
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Transfer to run; report its result through `complete_transfer`
    pub transfer: Option<TransferJob>,
    /// Rejected gesture or fatal failure raised during the tick
    pub error: Option<DeviceError>,
}

/// An in-progress recording
#[derive(Debug, Clone, Copy)]
struct ActiveRecording {
    /// Sensor latched when the recording started
    sensor: SensorType,
    deadline: Instant,
}

/// The bottle's state controller
pub struct Controller<C: Capture> {
    config: ControllerConfig,
    /// Current state
    state: State,
    /// Time when the current state was entered
    state_entered_at: Option<Instant>,
    selected: SensorType,
    store: MemoryStore,
    capture: C,
    /// Consecutive transfer failures
    fail_count: u8,
    /// Cap reading of the previous tick (for edge detection)
    previous_cap_open: bool,
    /// Selector reading of the previous tick, unset before the first tick
    last_selector: Option<u16>,
    last_readings: SensorReadings,
    selecting_deadline: Option<Instant>,
    recording: Option<ActiveRecording>,
    /// Id of the dispatched transfer awaiting completion
    outstanding_transfer: Option<u64>,
    next_transfer_id: u64,
    /// Cap edges seen while a transfer was outstanding
    pending_edges: VecDeque<CapEdge>,
    /// Error raised by the current step, handed out with its outcome
    raised: Option<DeviceError>,
    /// Channel for emitting device events
    event_tx: broadcast::Sender<DeviceEvent>,
}

impl<C: Capture> Controller<C> {
    /// Create a controller in Idle around a loaded memory store
    pub fn new(
        config: ControllerConfig,
        store: MemoryStore,
        capture: C,
        event_tx: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        info!(
            has_audio = store.flags().has_audio,
            has_color = store.flags().has_color,
            "controller started in Idle state"
        );

        Self {
            config,
            state: State::Idle,
            state_entered_at: None,
            selected: SensorType::default(),
            store,
            capture,
            fail_count: 0,
            previous_cap_open: false,
            last_selector: None,
            last_readings: SensorReadings::default(),
            selecting_deadline: None,
            recording: None,
            outstanding_transfer: None,
            next_transfer_id: 1,
            pending_edges: VecDeque::new(),
            raised: None,
            event_tx,
        }
    }

    /// Get the current state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn transfer_failures(&self) -> u8 {
        self.fail_count
    }

    pub fn status(&self) -> DeviceStatus {
        let flags = self.store.flags();
        DeviceStatus {
            state: self.state,
            selected_sensor: self.selected,
            has_audio: flags.has_audio,
            has_color: flags.has_color,
            can_pour: flags.is_complete(),
            transfer_failures: self.fail_count,
            sensors: self.last_readings,
        }
    }

    /// Advance the state machine by one tick
    pub fn tick(&mut self, readings: SensorReadings, now: Instant) -> TickOutcome {
        let snapshot = SensorSnapshot::new(readings, self.previous_cap_open);
        self.selected = snapshot.selected_sensor();
        self.last_readings = readings;

        let live_edge = snapshot.cap_edge();
        let transfer = if self.outstanding_transfer.is_some() {
            // Nothing sensor-driven may happen until the transfer completes
            if let Some(edge) = live_edge {
                self.buffer_edge(edge);
            }
            None
        } else {
            let edge = match self.pending_edges.pop_front() {
                Some(buffered) => {
                    if let Some(edge) = live_edge {
                        self.buffer_edge(edge);
                    }
                    debug!(?buffered, "replaying buffered cap edge");
                    Some(buffered)
                }
                None => live_edge,
            };
            self.step(&snapshot, edge, now)
        };

        // Edge detection must see the pre-update value for the whole tick
        self.previous_cap_open = readings.cap_open;
        self.last_selector = Some(readings.selector);

        TickOutcome {
            transfer,
            error: self.raised.take(),
        }
    }

    /// Apply the result of a dispatched transfer
    ///
    /// Completions for another id, or arriving after the controller left
    /// Transferring (a reset), are ignored. Returns the error when the
    /// failure exhausted the retry budget.
    pub fn complete_transfer(
        &mut self,
        id: u64,
        result: Result<(), TransferError>,
        now: Instant,
    ) -> Option<DeviceError> {
        if self.state != State::Transferring || self.outstanding_transfer != Some(id) {
            warn!(id, state = %self.state, "ignoring stale transfer completion");
            return None;
        }
        self.outstanding_transfer = None;

        match result {
            Ok(()) => {
                if let Err(e) = self.store.clear() {
                    self.fault(DeviceError::Storage(e), now);
                } else {
                    info!(id, "transfer succeeded");
                    self.fail_count = 0;
                    self.emit(DeviceEvent::TransferSucceeded { id });
                    self.transition_to(State::Idle, now);
                }
            }
            Err(e) => self.record_transfer_failure(id, e, now),
        }

        self.raised.take().filter(DeviceError::is_fatal)
    }

    /// Operator-forced transfer, only legal from Ready
    pub fn force_transfer(&mut self, now: Instant) -> Result<TransferJob, DeviceError> {
        if self.state != State::Ready {
            return Err(DeviceError::not_in_state("force_transfer", self.state));
        }

        info!("transfer forced by operator");
        match self.dispatch_transfer(now) {
            Some(job) => Ok(job),
            None => Err(self.raised.take().unwrap_or_else(|| DeviceError::TransferFailure {
                attempts: self.fail_count,
                max: self.config.max_transfer_failures,
                source: TransferError::Incomplete,
            })),
        }
    }

    /// Clear the memory and return to Idle from any state
    ///
    /// Timers, the failure counter, buffered edges and any outstanding
    /// transfer are dropped as well. The next tick re-seeds the selector
    /// baseline, so it never reads as movement.
    pub fn reset(&mut self, now: Instant) -> Result<(), DeviceError> {
        info!(state = %self.state, "reset requested");

        self.fail_count = 0;
        self.selecting_deadline = None;
        self.recording = None;
        self.outstanding_transfer = None;
        self.pending_edges.clear();
        self.raised = None;
        // The board is reset alongside; its new selector level is a baseline
        self.last_selector = None;

        if let Err(e) = self.store.clear() {
            let err = DeviceError::Storage(e);
            error!(error = %err, "reset could not clear memory");
            self.emit(DeviceEvent::Fault {
                reason: err.to_string(),
            });
            if self.state != State::Error {
                self.transition_to(State::Error, now);
            }
            return Err(err);
        }

        if self.state != State::Idle {
            self.transition_to(State::Idle, now);
        }
        self.emit(DeviceEvent::Reset);
        Ok(())
    }

    /// Run the handler of the current state
    fn step(
        &mut self,
        snapshot: &SensorSnapshot,
        edge: Option<CapEdge>,
        now: Instant,
    ) -> Option<TransferJob> {
        match self.state {
            State::Idle | State::Incomplete => {
                self.handle_waiting(snapshot, edge, now);
                None
            }
            State::Selecting => {
                self.handle_selecting(snapshot, edge, now);
                None
            }
            State::Recording => {
                self.handle_recording(edge, now);
                None
            }
            State::Ready => self.handle_ready(snapshot, now),
            // Outcomes arrive through complete_transfer
            State::Transferring => None,
            // Absorbing until reset
            State::Error => None,
        }
    }

    /// Idle and Incomplete: selector turn enters Selecting, cap open records.
    /// Both are evaluated, so a cap open on the same tick wins.
    fn handle_waiting(&mut self, snapshot: &SensorSnapshot, edge: Option<CapEdge>, now: Instant) {
        if self.selector_moved(snapshot, self.config.selector_threshold) {
            self.selecting_deadline = Some(now + self.config.selecting_timeout);
            self.transition_to(State::Selecting, now);
        }

        if edge == Some(CapEdge::Opened) {
            self.start_recording(snapshot, now);
        }
    }

    fn handle_selecting(&mut self, snapshot: &SensorSnapshot, edge: Option<CapEdge>, now: Instant) {
        if edge == Some(CapEdge::Opened) {
            self.start_recording(snapshot, now);
            return;
        }

        let expired = self.selecting_deadline.map_or(true, |deadline| now > deadline);
        if expired {
            debug!("selecting timed out");
            self.selecting_deadline = None;
            self.transition_to(State::Idle, now);
            return;
        }

        if self.selector_moved(snapshot, self.config.selector_keepalive_threshold) {
            self.selecting_deadline = Some(now + self.config.selecting_timeout);
        }
    }

    fn handle_recording(&mut self, edge: Option<CapEdge>, now: Instant) {
        let Some(recording) = self.recording else {
            warn!("recording state without an active recording");
            self.transition_to(State::Idle, now);
            return;
        };

        if edge == Some(CapEdge::Closed) {
            debug!("cap closed, stopping recording");
            self.stop_recording(recording.sensor, now);
        } else if now >= recording.deadline {
            debug!("recording duration reached, stopping recording");
            self.stop_recording(recording.sensor, now);
        }
    }

    fn handle_ready(&mut self, snapshot: &SensorSnapshot, now: Instant) -> Option<TransferJob> {
        if snapshot.is_pour_gesture() {
            info!("pour gesture detected");
            self.dispatch_transfer(now)
        } else {
            None
        }
    }

    fn start_recording(&mut self, snapshot: &SensorSnapshot, now: Instant) {
        if snapshot.tilted() && !self.store.is_complete() {
            let items = self.store.item_count();
            warn!(items, "incomplete pour attempt, recording not started");
            self.emit(DeviceEvent::IncompletePourAttempt { items });
            self.raised = Some(DeviceError::IncompletePourAttempt { items });
            return;
        }

        let sensor = self.selected;
        self.selecting_deadline = None;
        self.recording = Some(ActiveRecording {
            sensor,
            deadline: now + self.config.recording_duration,
        });
        self.transition_to(State::Recording, now);
        self.emit(DeviceEvent::RecordingStarted { sensor });

        if sensor == SensorType::Color {
            let color = snapshot.color();
            match self.capture.capture_color(color, &mut self.store) {
                Ok(()) => self.emit(DeviceEvent::ColorCaptured { color }),
                Err(e) => self.fault(DeviceError::CaptureIo(e), now),
            }
        }
    }

    fn stop_recording(&mut self, sensor: SensorType, now: Instant) {
        self.recording = None;

        if sensor == SensorType::Audio {
            let duration = self.config.recording_duration;
            match self.capture.capture_audio(duration, &mut self.store) {
                Ok(()) => self.emit(DeviceEvent::AudioCaptured),
                Err(e) => {
                    self.fault(DeviceError::CaptureIo(e), now);
                    return;
                }
            }
        }

        if let Err(e) = self.store.persist() {
            self.fault(DeviceError::CaptureIo(e.into()), now);
            return;
        }

        let items = self.store.item_count();
        self.emit(DeviceEvent::RecordingStopped { sensor, items });

        let next = match items {
            2 => State::Ready,
            1 => State::Incomplete,
            _ => {
                warn!("recording stopped with no items present");
                State::Idle
            }
        };
        self.transition_to(next, now);
    }

    fn dispatch_transfer(&mut self, now: Instant) -> Option<TransferJob> {
        self.transition_to(State::Transferring, now);

        if !self.store.is_complete() {
            let id = self.take_transfer_id();
            self.record_transfer_failure(id, TransferError::Incomplete, now);
            return None;
        }

        let id = self.take_transfer_id();
        self.outstanding_transfer = Some(id);
        self.emit(DeviceEvent::TransferDispatched { id });

        Some(TransferJob {
            id,
            audio_path: self.store.audio_path(),
            color_path: self.store.color_path(),
        })
    }

    fn record_transfer_failure(&mut self, id: u64, reason: TransferError, now: Instant) {
        let max = self.config.max_transfer_failures;
        self.fail_count = (self.fail_count + 1).min(max);
        let attempts = self.fail_count;

        warn!(id, attempts, max, error = %reason, "transfer failed");
        self.emit(DeviceEvent::TransferFailed {
            id,
            attempt: attempts,
            reason: reason.to_string(),
        });

        let err = DeviceError::TransferFailure {
            attempts,
            max,
            source: reason,
        };
        if err.is_fatal() {
            self.fault(err, now);
        } else {
            self.raised = Some(err);
            self.transition_to(State::Ready, now);
        }
    }

    /// Enter the Error state
    fn fault(&mut self, err: DeviceError, now: Instant) {
        error!(error = %err, "entering error state, reset required");
        self.emit(DeviceEvent::Fault {
            reason: err.to_string(),
        });
        self.recording = None;
        self.selecting_deadline = None;
        self.outstanding_transfer = None;
        self.raised = Some(err);
        self.transition_to(State::Error, now);
    }

    fn selector_moved(&self, snapshot: &SensorSnapshot, threshold: u16) -> bool {
        self.last_selector
            .map_or(false, |last| snapshot.selector().abs_diff(last) > threshold)
    }

    fn buffer_edge(&mut self, edge: CapEdge) {
        if self.pending_edges.len() >= self.config.edge_buffer_capacity {
            warn!(?edge, "edge buffer full, dropping oldest edge");
            self.pending_edges.pop_front();
        }
        debug!(?edge, "buffering cap edge during transfer");
        self.pending_edges.push_back(edge);
    }

    fn take_transfer_id(&mut self) -> u64 {
        let id = self.next_transfer_id;
        self.next_transfer_id += 1;
        id
    }

    /// Perform a state transition
    fn transition_to(&mut self, new_state: State, now: Instant) {
        let old_state = self.state;
        let duration_ms = self
            .state_entered_at
            .map(|t| now.saturating_duration_since(t).as_millis() as u64)
            .unwrap_or(0);

        info!(
            from = %old_state,
            to = %new_state,
            duration_ms = duration_ms,
            "state transition"
        );

        self.state = new_state;
        self.state_entered_at = Some(now);

        self.emit(DeviceEvent::StateChanged {
            from: old_state,
            to: new_state,
            duration_ms,
        });
    }

    fn emit(&self, event: DeviceEvent) {
        debug!(%event, "emitting event");
        let _ = self.event_tx.send(event);
    }
}
