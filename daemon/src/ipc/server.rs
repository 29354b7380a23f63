//! Unix domain socket server for IPC
//!
//! Provides request-response access to the device command surface and
//! pushes device events to subscribed clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::device::{DeviceHandle, Reply};
use crate::events::DeviceEvent;

use super::protocol::{DaemonStatus, Notification, Request, Response};

/// Largest accepted message body
const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

/// State shared by every client handler
struct Shared {
    device: DeviceHandle,
    events: broadcast::Sender<DeviceEvent>,
    start_time: Instant,
}

impl Server {
    /// Bind the IPC socket
    pub fn new(
        socket_path: &Path,
        device: DeviceHandle,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
                .context("failed to restrict socket permissions")?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
            shared: Arc::new(Shared {
                device,
                events,
                start_time: Instant::now(),
            }),
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let shared = Arc::clone(&self.shared);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = handle_client(stream, shared) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Serve one client until it disconnects
///
/// Frames are read on a separate task so that a notification going out
/// never interrupts a half-read request.
async fn handle_client(stream: UnixStream, shared: Arc<Shared>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (request_tx, mut request_rx) = mpsc::channel::<Request>(8);

    let reader_task = tokio::spawn(async move {
        loop {
            match read_message::<_, Request>(&mut reader).await {
                Ok(Some(request)) => {
                    if request_tx.send(request).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(?e, "dropping client after bad message");
                    break;
                }
            }
        }
    });

    let mut subscription: Option<broadcast::Receiver<DeviceEvent>> = None;

    let result = loop {
        tokio::select! {
            request = request_rx.recv() => {
                let Some(request) = request else {
                    break Ok(());
                };
                debug!(?request, "received request");

                let response = process_request(request, &shared, &mut subscription).await;
                if let Err(e) = send_message(&mut writer, &response).await {
                    break Err(e);
                }
            }

            event = next_event(&mut subscription) => {
                match event {
                    Ok(event) => {
                        let note = Notification::Event { event };
                        if let Err(e) = send_message(&mut writer, &note).await {
                            break Err(e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        subscription = None;
                    }
                }
            }
        }
    };

    reader_task.abort();
    result
}

/// Wait for the next event, or forever when not subscribed
async fn next_event(
    subscription: &mut Option<broadcast::Receiver<DeviceEvent>>,
) -> Result<DeviceEvent, broadcast::error::RecvError> {
    match subscription {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Process a request and return a response
async fn process_request(
    request: Request,
    shared: &Shared,
    subscription: &mut Option<broadcast::Receiver<DeviceEvent>>,
) -> Response {
    let Some(command) = request.to_command() else {
        return match request {
            Request::Subscribe => {
                *subscription = Some(shared.events.subscribe());
                debug!("client subscribed to notifications");
                Response::Subscribed
            }
            _ => Response::Pong,
        };
    };

    let name = command.name();
    match shared.device.execute(command).await {
        Ok(Reply::Status(device)) => {
            let uptime = shared.start_time.elapsed().as_secs();
            Response::Status(DaemonStatus::new(device, uptime))
        }
        Ok(Reply::Files(files)) => Response::Files { files },
        Err(e) => {
            info!(command = name, error = %e, "command rejected");
            Response::from(&e)
        }
    }
}

/// Read one length-prefixed JSON message; `None` on clean EOF
async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];

    // Read message length (4-byte little-endian)
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_MESSAGE_LEN, "message too large ({len} bytes)");

    // Read message body
    let mut msg_buf = vec![0u8; len];
    reader.read_exact(&mut msg_buf).await?;

    let message = serde_json::from_slice(&msg_buf).context("failed to parse message")?;
    Ok(Some(message))
}

/// Send a length-prefixed JSON message
async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let msg_bytes = serde_json::to_vec(msg)?;
    let msg_len = (msg_bytes.len() as u32).to_le_bytes();

    writer.write_all(&msg_len).await?;
    writer.write_all(&msg_bytes).await?;

    Ok(())
}
