/// PS4 debug stub client
///
/// Speaks the ps4debug command protocol over TCP: a strict
/// request/response command connection plus, while a process is attached,
/// an interrupt channel the stub connects back on to report stopped threads.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

pub mod config;
mod console;
mod debug;
pub mod discovery;
pub mod interrupt;
mod kernel;
mod process;
mod session;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::DebuggerConfig;
pub use discovery::{find_playstation, find_playstation_from, DiscoveryError};
pub use interrupt::{ChannelState, FramingError, InterruptHandler};
pub use transport::{ByteStream, TransportError};
pub use types::*;
pub use wire::{Command, CommandStatus};

use interrupt::InterruptChannel;
use transport::Transport;

/// Misuse detected locally, before anything is sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("not connected to the console")]
    NotConnected,
    #[error("no process is being debugged")]
    NotDebugging,
    #[error("a process is already being debugged")]
    AlreadyDebugging,
    #[error("no console address to connect to")]
    NoEndpoint,
    #[error("breakpoint index {index} out of range (capacity {capacity})")]
    BreakpointIndexOutOfRange { index: u32, capacity: u32 },
    #[error("watchpoint index {index} out of range (capacity {capacity})")]
    WatchpointIndexOutOfRange { index: u32, capacity: u32 },
    #[error("payload of {len} bytes exceeds the {max}-byte command limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("length {0} does not fit the 32-bit length field")]
    LengthOutOfRange(usize),
    #[error("remote call takes at most {max} arguments, got {given}")]
    TooManyArguments { given: usize, max: usize },
    #[error("scan values must have the same type")]
    MismatchedScanValues,
}

#[derive(Error, Debug)]
pub enum DebugError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error("{command} failed with status {status}")]
    Protocol {
        command: Command,
        status: CommandStatus,
    },
    #[error("{command} reported an invalid count {count}")]
    BadCount { command: Command, count: i32 },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("interrupt framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl DebugError {
    /// Status word of a rejected command, if that is what this error is.
    pub fn status(&self) -> Option<CommandStatus> {
        match self {
            DebugError::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DebugError>;

/// Returns the version of the protocol this library implements.
pub const LIBRARY_VERSION: &str = "1.2";

/// Observable phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connected,
    Debugging,
}

/// Resources owned in each phase. The interrupt channel only exists while
/// a process is attached, so the phase and its resources cannot disagree.
pub(crate) enum SessionState {
    Disconnected,
    Connected(Transport),
    Debugging(Transport, InterruptChannel),
}

impl SessionState {
    pub(crate) fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Disconnected => SessionPhase::Disconnected,
            SessionState::Connected(_) => SessionPhase::Connected,
            SessionState::Debugging(..) => SessionPhase::Debugging,
        }
    }

    pub(crate) fn transport(&mut self) -> Option<&mut Transport> {
        match self {
            SessionState::Disconnected => None,
            SessionState::Connected(transport) | SessionState::Debugging(transport, _) => {
                Some(transport)
            }
        }
    }

    /// Drop into `Disconnected`, handing back whatever was owned.
    pub(crate) fn take(&mut self) -> (Option<Transport>, Option<InterruptChannel>) {
        match std::mem::replace(self, SessionState::Disconnected) {
            SessionState::Disconnected => (None, None),
            SessionState::Connected(transport) => (Some(transport), None),
            SessionState::Debugging(transport, channel) => (Some(transport), Some(channel)),
        }
    }
}

/// Checks a command against the session phase before anything is sent.
pub(crate) fn guard(phase: SessionPhase, command: Command) -> std::result::Result<(), UsageError> {
    match phase {
        SessionPhase::Disconnected => Err(UsageError::NotConnected),
        SessionPhase::Connected if command.requires_debugging() => Err(UsageError::NotDebugging),
        _ => Ok(()),
    }
}

/// Client for one console.
///
/// Commands take `&mut self`: the protocol allows a single exchange at a
/// time on the command connection.
pub struct Ps4Debugger {
    endpoint: Option<SocketAddr>,
    config: DebuggerConfig,
    pub(crate) state: SessionState,
}

impl Ps4Debugger {
    /// Client for the stub at `addr` with default settings
    pub fn new(addr: IpAddr) -> Self {
        Self::with_config(addr, DebuggerConfig::default())
    }

    /// Client for the stub at `addr`, using `config.port`
    pub fn with_config(addr: IpAddr, config: DebuggerConfig) -> Self {
        Self {
            endpoint: Some(SocketAddr::new(addr, config.port)),
            config,
            state: SessionState::Disconnected,
        }
    }

    /// Wrap an already-open command stream. The session starts `Connected`
    /// and has no address to reconnect to.
    pub fn from_stream<S: ByteStream + 'static>(stream: S, config: DebuggerConfig) -> Self {
        let transport = Transport::from_stream(stream, config.recv_timeout);
        Self {
            endpoint: None,
            config,
            state: SessionState::Connected(transport),
        }
    }

    /// Address of the command port, if the session was built from one
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    /// Current session phase
    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    /// Check if the command connection is open
    pub fn is_connected(&self) -> bool {
        self.phase() != SessionPhase::Disconnected
    }

    /// Check if a process is attached
    pub fn is_debugging(&self) -> bool {
        self.phase() == SessionPhase::Debugging
    }

    /// State of the interrupt channel while a process is attached.
    pub fn interrupt_state(&self) -> Option<ChannelState> {
        match &self.state {
            SessionState::Debugging(_, channel) => Some(channel.state()),
            _ => None,
        }
    }

    /// Open the command connection. Does nothing when already connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let endpoint = self.endpoint.ok_or(UsageError::NoEndpoint)?;

        let transport = Transport::connect(
            endpoint,
            self.config.connect_timeout,
            self.config.recv_timeout,
        )
        .await
        .map_err(|e| {
            log::error!("Failed to connect to {}: {}", endpoint, e);
            e
        })?;

        self.state = SessionState::Connected(transport);
        log::info!("Connected to console at {}", endpoint);
        Ok(())
    }

    /// Detach if a process is attached, then end the connection.
    ///
    /// The connection is ended even when the detach fails; that failure is
    /// still returned so a dead connection does not look like a clean close.
    pub async fn close(mut self) -> Result<()> {
        let detached = if self.is_debugging() {
            self.detach_debugger().await.map_err(|e| {
                log::warn!("Detach during close failed: {}", e);
                e
            })
        } else {
            Ok(())
        };
        if self.is_connected() {
            self.disconnect().await?;
        }
        detached
    }
}

#[cfg(test)]
impl Ps4Debugger {
    /// Session over `stream` that counts as attached, with an idle
    /// interrupt channel listening on loopback.
    pub(crate) async fn attached_over<S: ByteStream + 'static>(stream: S) -> Self {
        let config = DebuggerConfig {
            interrupt_bind: "127.0.0.1:0".parse().unwrap(),
            ..DebuggerConfig::default()
        };
        let channel = InterruptChannel::listen(
            config.interrupt_bind,
            config.poll_interval,
            |_: DebugInterrupt| {},
        )
        .await
        .unwrap();
        let transport = Transport::from_stream(stream, config.recv_timeout);
        Self {
            endpoint: None,
            config,
            state: SessionState::Debugging(transport, channel),
        }
    }
}
