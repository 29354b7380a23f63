//! Device runtime
//!
//! Owns the controller, the sensor board and the transport, and runs the
//! single-threaded tick loop. Operator commands arrive over a channel and
//! are applied between ticks; a sensor command is followed by an immediate
//! tick so its reply already reflects the transition it caused. Transfers
//! run as spawned tasks and report back over a completion channel.

pub mod console;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::capture::Capture;
use crate::memory::StoredFile;
use crate::sensors::{Rgb, SensorBoard};
use crate::state::{Controller, DeviceError, DeviceStatus};
use crate::transfer::{TransferError, TransferJob, Transport};

/// Operator commands accepted by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    OpenCap,
    CloseCap,
    SetTilt(bool),
    SetSelector(u16),
    SetColor(Rgb),
    ForceTransfer,
    Reset,
    GetStatus,
    ListFiles,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::OpenCap => "open_cap",
            Command::CloseCap => "close_cap",
            Command::SetTilt(_) => "set_tilt",
            Command::SetSelector(_) => "set_selector",
            Command::SetColor(_) => "set_color",
            Command::ForceTransfer => "force_transfer",
            Command::Reset => "reset",
            Command::GetStatus => "get_status",
            Command::ListFiles => "list_files",
        }
    }
}

/// Successful result of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(DeviceStatus),
    Files(Vec<StoredFile>),
}

type CommandResult = Result<Reply, DeviceError>;

struct Envelope {
    command: Command,
    reply: oneshot::Sender<CommandResult>,
}

type Completion = (u64, Result<(), TransferError>);

/// Cloneable handle for sending commands to the device loop
#[derive(Clone)]
pub struct DeviceHandle {
    tx: mpsc::Sender<Envelope>,
}

impl DeviceHandle {
    /// Run `command` on the device loop and wait for its reply
    pub async fn execute(&self, command: Command) -> CommandResult {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { command, reply })
            .await
            .map_err(|_| DeviceError::Unavailable)?;
        rx.await.map_err(|_| DeviceError::Unavailable)?
    }
}

/// The running appliance
pub struct Device<C: Capture> {
    controller: Controller<C>,
    board: SensorBoard,
    transport: Arc<dyn Transport>,
    tick_interval: Duration,
    commands: mpsc::Receiver<Envelope>,
}

impl<C: Capture> Device<C> {
    pub fn new(
        controller: Controller<C>,
        board: SensorBoard,
        transport: Arc<dyn Transport>,
        tick_interval: Duration,
    ) -> (Self, DeviceHandle) {
        let (tx, commands) = mpsc::channel(32);
        let device = Self {
            controller,
            board,
            transport,
            tick_interval,
            commands,
        };
        (device, DeviceHandle { tx })
    }

    /// Run the tick loop until every handle is dropped
    pub async fn run(mut self) {
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(8);
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            "device loop started"
        );

        // The first interval tick completes immediately. Spend it before any
        // command is applied so the controller has its sensor baselines.
        ticker.tick().await;
        if let Err(e) = self.tick(&done_tx) {
            debug!(error = %e, "initial tick raised an error");
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&done_tx) {
                        debug!(error = %e, "tick raised an error");
                    }
                }

                Some((id, result)) = done_rx.recv() => {
                    if let Some(e) = self.controller.complete_transfer(id, result, Instant::now()) {
                        warn!(error = %e, "transfer escalated to error state");
                    }
                }

                envelope = self.commands.recv() => {
                    let Some(Envelope { command, reply }) = envelope else {
                        break;
                    };
                    debug!(command = command.name(), "executing command");
                    let result = self.execute(command, &done_tx);
                    let _ = reply.send(result);
                }
            }
        }

        info!("device loop stopped");
    }

    fn execute(&mut self, command: Command, done_tx: &mpsc::Sender<Completion>) -> CommandResult {
        match command {
            Command::OpenCap => {
                self.board.open_cap();
                self.tick(done_tx)
            }
            Command::CloseCap => {
                self.board.close_cap();
                self.tick(done_tx)
            }
            Command::SetTilt(tilted) => {
                self.board.set_tilt(tilted);
                self.tick(done_tx)
            }
            Command::SetSelector(value) => {
                self.board
                    .set_selector(value)
                    .map_err(|e| DeviceError::invalid_command("set_selector", e.to_string()))?;
                self.tick(done_tx)
            }
            Command::SetColor(color) => {
                self.board.set_color(color);
                self.tick(done_tx)
            }
            Command::ForceTransfer => {
                let job = self.controller.force_transfer(Instant::now())?;
                self.dispatch(job, done_tx);
                Ok(Reply::Status(self.controller.status()))
            }
            Command::Reset => {
                self.controller.reset(Instant::now())?;
                self.board.reset();
                self.tick(done_tx)
            }
            Command::GetStatus => Ok(Reply::Status(self.controller.status())),
            Command::ListFiles => self
                .controller
                .store()
                .list_files()
                .map(Reply::Files)
                .map_err(DeviceError::Storage),
        }
    }

    /// Sample the board and advance the controller once
    fn tick(&mut self, done_tx: &mpsc::Sender<Completion>) -> CommandResult {
        let outcome = self.controller.tick(self.board.sample(), Instant::now());

        if let Some(job) = outcome.transfer {
            self.dispatch(job, done_tx);
        }

        match outcome.error {
            Some(e) => Err(e),
            None => Ok(Reply::Status(self.controller.status())),
        }
    }

    fn dispatch(&self, job: TransferJob, done_tx: &mpsc::Sender<Completion>) {
        let transport = Arc::clone(&self.transport);
        let done_tx = done_tx.clone();

        info!(id = job.id, "dispatching transfer");
        tokio::spawn(async move {
            let result = transport.transfer(&job).await;
            if done_tx.send((job.id, result)).await.is_err() {
                warn!(id = job.id, "device loop gone, dropping transfer result");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::broadcast;

    use crate::capture::SimulatedCapture;
    use crate::config::ControllerConfig;
    use crate::memory::MemoryStore;
    use crate::state::State;
    use crate::transfer::SimulatedRelay;

    fn spawn_device(dir: &std::path::Path, transport: SimulatedRelay) -> DeviceHandle {
        let store = MemoryStore::open(dir).unwrap();
        let (tx, _rx) = broadcast::channel(64);
        let controller = Controller::new(
            ControllerConfig::default(),
            store,
            SimulatedCapture::new(100),
            tx,
        );
        let (device, handle) = Device::new(
            controller,
            SensorBoard::new(),
            Arc::new(transport),
            Duration::from_secs(3600),
        );
        tokio::spawn(device.run());
        handle
    }

    async fn status(handle: &DeviceHandle, command: Command) -> DeviceStatus {
        match handle.execute(command).await.unwrap() {
            Reply::Status(status) => status,
            other => panic!("expected status, got {other:?}"),
        }
    }

    async fn wait_for_state(handle: &DeviceHandle, want: State) -> DeviceStatus {
        for _ in 0..200 {
            let current = status(handle, Command::GetStatus).await;
            if current.state == want {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("device never reached {want}");
    }

    async fn fill_memory(handle: &DeviceHandle) {
        status(handle, Command::SetSelector(3000)).await;
        status(handle, Command::OpenCap).await;
        status(handle, Command::CloseCap).await;
        status(handle, Command::SetSelector(0)).await;
        status(handle, Command::OpenCap).await;
        let ready = status(handle, Command::CloseCap).await;
        assert_eq!(ready.state, State::Ready);
    }

    #[tokio::test]
    async fn test_commands_tick_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_device(dir.path(), SimulatedRelay::new(Duration::ZERO));

        let selecting = status(&handle, Command::SetSelector(3000)).await;
        assert_eq!(selecting.state, State::Selecting);

        let recording = status(&handle, Command::OpenCap).await;
        assert_eq!(recording.state, State::Recording);
        assert!(recording.has_color);

        let incomplete = status(&handle, Command::CloseCap).await;
        assert_eq!(incomplete.state, State::Incomplete);
    }

    #[tokio::test]
    async fn test_pour_transfers_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_device(dir.path(), SimulatedRelay::new(Duration::from_millis(20)));
        fill_memory(&handle).await;

        status(&handle, Command::SetTilt(true)).await;
        let pouring = status(&handle, Command::OpenCap).await;
        assert_eq!(pouring.state, State::Transferring);

        let idle = wait_for_state(&handle, State::Idle).await;
        assert!(!idle.has_audio && !idle.has_color);
        assert_eq!(idle.transfer_failures, 0);
    }

    #[tokio::test]
    async fn test_failing_relay_reaches_error() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_device(dir.path(), SimulatedRelay::failing(Duration::ZERO));
        fill_memory(&handle).await;

        status(&handle, Command::SetTilt(true)).await;
        // Still pouring after each failure, so every command tick retries
        let _ = handle.execute(Command::OpenCap).await;
        for _ in 0..200 {
            let current = status(&handle, Command::GetStatus).await;
            if current.state == State::Error {
                break;
            }
            let _ = handle.execute(Command::SetColor(Rgb::default())).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let failed = wait_for_state(&handle, State::Error).await;
        assert_eq!(failed.transfer_failures, 3);

        let reset = status(&handle, Command::Reset).await;
        assert_eq!(reset.state, State::Idle);
        assert_eq!(reset.transfer_failures, 0);
        assert!(!reset.sensors.cap_open && !reset.sensors.tilted);
    }

    #[tokio::test]
    async fn test_reset_with_selector_turned_returns_idle() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_device(dir.path(), SimulatedRelay::new(Duration::ZERO));
        status(&handle, Command::SetSelector(3000)).await;
        status(&handle, Command::OpenCap).await;
        status(&handle, Command::CloseCap).await;

        let once = status(&handle, Command::Reset).await;
        assert_eq!(once.state, State::Idle);
        assert_eq!(once.sensors.selector, 0);
        assert!(!once.has_color);

        let twice = status(&handle, Command::Reset).await;
        assert_eq!(twice, once);
    }

    #[tokio::test]
    async fn test_reset_from_error_with_selector_turned() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_device(dir.path(), SimulatedRelay::failing(Duration::ZERO));
        fill_memory(&handle).await;
        status(&handle, Command::SetSelector(3000)).await;
        status(&handle, Command::SetTilt(true)).await;
        let _ = handle.execute(Command::OpenCap).await;
        for _ in 0..200 {
            if status(&handle, Command::GetStatus).await.state == State::Error {
                break;
            }
            let _ = handle.execute(Command::SetColor(Rgb::default())).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        wait_for_state(&handle, State::Error).await;

        let reset = status(&handle, Command::Reset).await;
        assert_eq!(reset.state, State::Idle);
        assert_eq!(reset.transfer_failures, 0);
    }

    #[tokio::test]
    async fn test_failed_reset_keeps_board() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_device(dir.path(), SimulatedRelay::new(Duration::ZERO));
        // A directory in place of the audio artifact makes the clear fail
        std::fs::create_dir(dir.path().join("audio.wav")).unwrap();
        status(&handle, Command::SetTilt(true)).await;

        let err = handle.execute(Command::Reset).await.unwrap_err();
        assert_eq!(err.code(), "storage_error");

        let after = status(&handle, Command::GetStatus).await;
        assert_eq!(after.state, State::Error);
        assert!(after.sensors.tilted);
    }

    #[tokio::test]
    async fn test_invalid_commands_reported() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_device(dir.path(), SimulatedRelay::new(Duration::ZERO));

        let err = handle.execute(Command::ForceTransfer).await.unwrap_err();
        assert_eq!(err.code(), "invalid_command");

        let err = handle.execute(Command::SetSelector(5000)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_command");

        status(&handle, Command::SetTilt(true)).await;
        let err = handle.execute(Command::OpenCap).await.unwrap_err();
        assert_eq!(err.code(), "incomplete_pour_attempt");
        assert_eq!(status(&handle, Command::GetStatus).await.state, State::Idle);
    }

    #[tokio::test]
    async fn test_list_files() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_device(dir.path(), SimulatedRelay::new(Duration::ZERO));
        status(&handle, Command::SetSelector(3000)).await;
        status(&handle, Command::OpenCap).await;
        status(&handle, Command::CloseCap).await;

        let Reply::Files(files) = handle.execute(Command::ListFiles).await.unwrap() else {
            panic!("expected file listing");
        };
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["color.dat", "recordings.txt"]);
    }
}
