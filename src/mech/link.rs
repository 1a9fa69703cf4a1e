//! Single-writer command link to the mech controller.
//!
//! The mech speaks a half-duplex protocol over one TCP connection: a command is
//! written, then the reply is read up to the prompt. Interleaving two commands
//! corrupts both replies, so every exchange happens through a [`LinkLease`] that
//! grants exclusive use of the connection. Leases are RAII guards: dropping one
//! frees the link for the next caller.
//!
//! Failures are surfaced, never hidden:
//! - a reply that does not arrive within the command timeout yields
//!   `DaqError::LinkTimeout` and the connection is dropped so the next command starts
//!   from a clean stream;
//! - a closed or broken connection yields `DaqError::LinkDisconnected`. One
//!   reconnection attempt is made so the link is usable again, but the failed command
//!   is not resent;
//! - after a controller reboot every command fails with `DaqError::MechRebooted`
//!   until [`MechLink::acknowledge_reboot`] is called.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use spectro_daq::mech::{MechLink, TcpConnector};
//!
//! # async fn example() -> spectro_daq::error::AppResult<()> {
//! let connector = Arc::new(TcpConnector::new("10.25.1.140", 23));
//! let link = MechLink::new(connector, Duration::from_secs(5), None);
//!
//! let mut lease = link.acquire("operator", Duration::from_secs(2)).await?;
//! let reply = lease.send("rp", Duration::from_secs(5)).await?;
//! println!("{}", reply.raw);
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::log::{Direction, MechLog};
use super::protocol::{self, MechResponse, REBOOT_MARKER};
use crate::error::{AppResult, DaqError};

/// Byte stream carrying the mech protocol.
pub trait MechStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> MechStream for T {}

/// Opens connections to the mech controller.
///
/// Production code uses [`TcpConnector`]; tests use the simulated controller in
/// [`crate::mech::mock`].
#[async_trait]
pub trait MechConnector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> std::io::Result<Box<dyn MechStream>>;

    /// Human readable endpoint, used in logs and errors.
    fn describe(&self) -> String;
}

/// TCP connection to a networked mech controller.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    port: u16,
}

impl TcpConnector {
    /// Create a connector for `address:port`.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

#[async_trait]
impl MechConnector for TcpConnector {
    async fn connect(&self) -> std::io::Result<Box<dyn MechStream>> {
        let stream = TcpStream::connect((self.address.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.address, self.port)
    }
}

/// Connection state guarded by the single-writer lock.
struct LinkState {
    stream: Option<Box<dyn MechStream>>,
    next_id: u32,
    rebooted: bool,
    /// Set while a command is on the wire; still set if the sender was cancelled.
    in_flight: bool,
}

/// State shared by the link and its leases.
struct LinkShared {
    connector: Arc<dyn MechConnector>,
    connect_timeout: Duration,
    log: Option<MechLog>,
    owner: StdMutex<Option<String>>,
}

impl LinkShared {
    fn set_owner(&self, owner: Option<String>) {
        if let Ok(mut current) = self.owner.lock() {
            *current = owner;
        }
    }

    fn record(&self, direction: Direction, text: &str) {
        if let Some(log) = &self.log {
            if let Err(e) = log.record(direction, text) {
                tracing::warn!(error = %e, path = %log.path().display(), "Failed to write mech log");
            }
        }
    }

    async fn open(&self) -> AppResult<Box<dyn MechStream>> {
        let endpoint = self.connector.describe();
        match tokio::time::timeout(self.connect_timeout, self.connector.connect()).await {
            Ok(Ok(stream)) => {
                tracing::info!(endpoint = %endpoint, "Connected to mech");
                Ok(stream)
            }
            Ok(Err(e)) => Err(DaqError::LinkDisconnected(format!(
                "cannot connect to {endpoint}: {e}"
            ))),
            Err(_) => Err(DaqError::LinkDisconnected(format!(
                "connection to {endpoint} timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }
}

/// Shared handle to the mech connection.
///
/// Cloning is cheap; all clones serialize on the same connection.
#[derive(Clone)]
pub struct MechLink {
    shared: Arc<LinkShared>,
    state: Arc<Mutex<LinkState>>,
}

impl std::fmt::Debug for MechLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MechLink")
            .field("endpoint", &self.shared.connector.describe())
            .field("owner", &self.current_owner())
            .finish()
    }
}

impl MechLink {
    /// Create a link. The connection is opened on first use.
    pub fn new(
        connector: Arc<dyn MechConnector>,
        connect_timeout: Duration,
        log: Option<MechLog>,
    ) -> Self {
        Self {
            shared: Arc::new(LinkShared {
                connector,
                connect_timeout,
                log,
                owner: StdMutex::new(None),
            }),
            state: Arc::new(Mutex::new(LinkState {
                stream: None,
                next_id: 1,
                rebooted: false,
                in_flight: false,
            })),
        }
    }

    /// Acquire exclusive use of the link.
    ///
    /// Waits at most `wait` for the current holder to finish. On timeout the error
    /// names the holder so operators can see what is occupying the link.
    pub async fn acquire(&self, owner: &str, wait: Duration) -> AppResult<LinkLease> {
        match tokio::time::timeout(wait, self.state.clone().lock_owned()).await {
            Ok(guard) => {
                self.shared.set_owner(Some(owner.to_string()));
                tracing::trace!(owner = %owner, "Mech link acquired");
                Ok(LinkLease {
                    guard,
                    shared: self.shared.clone(),
                    owner: owner.to_string(),
                })
            }
            Err(_) => Err(DaqError::LinkBusy {
                owner: self.current_owner(),
                waited: wait,
            }),
        }
    }

    /// Send one command under a short-lived lease.
    ///
    /// The lease wait is bounded by the command timeout.
    pub async fn send(&self, command: &str, timeout: Duration) -> AppResult<MechResponse> {
        let mut lease = self.acquire(command, timeout).await?;
        lease.send(command, timeout).await
    }

    /// Holder of the current lease, if any.
    pub fn current_owner(&self) -> Option<String> {
        self.shared.owner.lock().ok().and_then(|o| o.clone())
    }

    /// Acknowledge a controller reboot so commands are accepted again.
    pub async fn acknowledge_reboot(&self, timeout: Duration) -> AppResult<()> {
        let mut lease = self.acquire("reboot-ack", timeout).await?;
        lease.send(REBOOT_MARKER, timeout).await.map(|_| ())
    }

    /// Whether the controller has rebooted and awaits acknowledgement.
    pub async fn is_rebooted(&self) -> bool {
        self.state.lock().await.rebooted
    }

    /// Endpoint description.
    pub fn endpoint(&self) -> String {
        self.shared.connector.describe()
    }
}

/// Exclusive use of the mech link. Released on drop.
pub struct LinkLease {
    guard: OwnedMutexGuard<LinkState>,
    shared: Arc<LinkShared>,
    owner: String,
}

impl std::fmt::Debug for LinkLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkLease")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl LinkLease {
    /// Owner recorded for this lease.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Send a command and wait up to `timeout` for its complete reply.
    pub async fn send(&mut self, command: &str, timeout: Duration) -> AppResult<MechResponse> {
        let is_ack = command == REBOOT_MARKER;
        if self.guard.rebooted && !is_ack {
            return Err(DaqError::MechRebooted);
        }

        if self.guard.in_flight {
            // The previous caller gave up mid-exchange; its reply may still arrive.
            tracing::debug!("Discarding mech connection with an unanswered command");
            self.guard.stream = None;
            self.guard.in_flight = false;
        }

        if self.guard.stream.is_none() {
            let stream = self.shared.open().await?;
            self.guard.stream = Some(stream);
        }

        let id = if is_ack {
            None
        } else {
            let id = self.guard.next_id;
            self.guard.next_id = self.guard.next_id.checked_add(1).unwrap_or(1);
            Some(id)
        };
        let frame = protocol::encode_command(command, id);

        tracing::debug!(owner = %self.owner, command = %frame.trim_end(), "Mech command");
        self.shared.record(Direction::Sent, frame.trim_end());

        self.guard.in_flight = true;
        let exchange = async {
            let stream = self
                .guard
                .stream
                .as_mut()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
            stream.write_all(frame.as_bytes()).await?;
            stream.flush().await?;
            read_reply(stream).await
        };

        let result = tokio::time::timeout(timeout, exchange).await;
        self.guard.in_flight = false;
        let raw = match result {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(self.handle_broken(command, e).await),
            Err(_) => {
                // Late bytes would be read as the reply to the next command.
                self.guard.stream = None;
                tracing::warn!(command = %command, ?timeout, "Mech reply timed out");
                return Err(DaqError::LinkTimeout {
                    command: command.to_string(),
                    timeout,
                });
            }
        };

        self.shared.record(Direction::Received, &raw);

        match protocol::parse_response(&raw, id) {
            Ok(response) => {
                if is_ack {
                    tracing::info!("Mech reboot acknowledged");
                    self.guard.rebooted = false;
                }
                Ok(response)
            }
            Err(DaqError::MechRebooted) if is_ack => {
                self.guard.rebooted = false;
                Ok(MechResponse {
                    replies: Vec::new(),
                    raw,
                })
            }
            Err(DaqError::MechRebooted) => {
                tracing::warn!(command = %command, "Mech controller reports a reboot");
                self.guard.rebooted = true;
                Err(DaqError::MechRebooted)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_broken(&mut self, command: &str, error: std::io::Error) -> DaqError {
        self.guard.stream = None;
        tracing::warn!(command = %command, error = %error, "Mech connection lost");

        match self.shared.open().await {
            Ok(stream) => {
                self.guard.stream = Some(stream);
                tracing::info!("Mech connection re-established; command not resent");
            }
            Err(e) => tracing::error!(error = %e, "Mech reconnection failed"),
        }

        DaqError::LinkDisconnected(format!("connection lost while sending {command:?}: {error}"))
    }
}

impl Drop for LinkLease {
    fn drop(&mut self) {
        tracing::trace!(owner = %self.owner, "Mech link released");
        self.shared.set_owner(None);
    }
}

async fn read_reply(stream: &mut Box<dyn MechStream>) -> std::io::Result<String> {
    let mut buffer = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "mech closed the connection",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
        if protocol::is_complete(&buffer) {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
