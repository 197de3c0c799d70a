/// Debug interrupt channel
///
/// While a process is attached, the stub connects back to the client on a
/// second TCP connection and pushes one fixed-size record every time a
/// debugged thread stops. The channel runs as a background task:
///
/// `Idle -> Listening -> Connected -> Delivering -> Stopped`
///
/// The stream has no framing marker. A read that does not produce exactly one
/// record is dropped and delivery goes on; nothing tries to resynchronise.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, Interest};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportError;
use crate::types::DebugInterrupt;
use crate::wire::{decode_fixed, DEBUG_INTERRUPT_SIZE};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("interrupt record has {actual} bytes, expected {expected}")]
    WrongSize { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Listening,
    Connected,
    Delivering,
    Stopped,
}

/// Receives every debug interrupt, in arrival order, on the channel's task.
pub trait InterruptHandler: Send {
    fn on_interrupt(&mut self, interrupt: DebugInterrupt);
}

impl<F> InterruptHandler for F
where
    F: FnMut(DebugInterrupt) + Send,
{
    fn on_interrupt(&mut self, interrupt: DebugInterrupt) {
        self(interrupt)
    }
}

pub fn decode_interrupt(bytes: &[u8]) -> Result<DebugInterrupt, FramingError> {
    if bytes.len() != DEBUG_INTERRUPT_SIZE {
        return Err(FramingError::WrongSize {
            expected: DEBUG_INTERRUPT_SIZE,
            actual: bytes.len(),
        });
    }
    Ok(decode_fixed(bytes))
}

/// Decode one received buffer and hand it to `handler`.
///
/// Returns `false` when the buffer was discarded.
pub fn dispatch<H: InterruptHandler + ?Sized>(bytes: &[u8], handler: &mut H) -> bool {
    match decode_interrupt(bytes) {
        Ok(interrupt) => {
            log::debug!(
                "INTERRUPT: lwpid={} status=0x{:X} thread={:?} rip=0x{:X}",
                interrupt.lwpid,
                interrupt.status,
                interrupt.thread_name,
                interrupt.registers.rip
            );
            handler.on_interrupt(interrupt);
            true
        }
        Err(e) => {
            log::warn!("Discarding interrupt data: {}", e);
            false
        }
    }
}

/// Handle to the running interrupt task
pub struct InterruptChannel {
    state: watch::Receiver<ChannelState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl InterruptChannel {
    /// Spawn the channel and wait until it is listening on `bind`.
    ///
    /// The stub connects as soon as it processes the attach command, so the
    /// attach must not be sent before this returns.
    pub async fn listen<H: InterruptHandler + 'static>(
        bind: SocketAddr,
        poll_interval: Duration,
        handler: H,
    ) -> Result<Self, TransportError> {
        let (state_tx, state) = watch::channel(ChannelState::Idle);
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(run_channel(
            bind,
            poll_interval,
            handler,
            state_tx,
            shutdown.clone(),
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(local_addr)) => Ok(Self {
                state,
                shutdown,
                task: Some(task),
                local_addr,
            }),
            Ok(Err(e)) => {
                let _ = task.await;
                Err(TransportError::Io(e))
            }
            Err(_) => Err(TransportError::Closed),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Follow state transitions as they happen.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancel the task and wait for it to exit, releasing the listener.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Interrupt channel task failed: {}", e);
            }
        }
        log::debug!("Interrupt channel on {} stopped", self.local_addr);
    }
}

impl Drop for InterruptChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn set_state(state: &watch::Sender<ChannelState>, next: ChannelState) {
    state.send_modify(|current| {
        log::trace!("Interrupt channel: {:?} -> {:?}", *current, next);
        *current = next;
    });
}

/// Whether the peer has shut down its side. Bytes it sent before that may
/// still be buffered, so a peek alone cannot tell.
async fn peer_hung_up(stream: &TcpStream) -> bool {
    matches!(stream.ready(Interest::READABLE).await, Ok(ready) if ready.is_read_closed())
}

async fn run_channel<H: InterruptHandler + 'static>(
    bind: SocketAddr,
    poll_interval: Duration,
    mut handler: H,
    state: watch::Sender<ChannelState>,
    shutdown: CancellationToken,
    ready: oneshot::Sender<io::Result<SocketAddr>>,
) {
    let bound = match TcpListener::bind(bind).await {
        Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
        Err(e) => Err(e),
    };
    let (listener, local_addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            log::error!("Interrupt channel could not listen on {}: {}", bind, e);
            set_state(&state, ChannelState::Stopped);
            let _ = ready.send(Err(e));
            return;
        }
    };

    set_state(&state, ChannelState::Listening);
    log::debug!("Interrupt channel listening on {}", local_addr);
    let _ = ready.send(Ok(local_addr));

    let accepted = tokio::select! {
        _ = shutdown.cancelled() => None,
        res = listener.accept() => match res {
            Ok((stream, peer)) => {
                log::debug!("Interrupt channel accepted {}", peer);
                Some(stream)
            }
            Err(e) => {
                log::error!("Interrupt channel accept failed: {}", e);
                None
            }
        },
    };

    if let Some(stream) = accepted {
        let _ = stream.set_nodelay(true);
        set_state(&state, ChannelState::Connected);
        deliver(stream, poll_interval, &mut handler, &state, &shutdown).await;
    }

    drop(listener);
    set_state(&state, ChannelState::Stopped);
}

async fn deliver<H: InterruptHandler>(
    mut stream: TcpStream,
    poll_interval: Duration,
    handler: &mut H,
    state: &watch::Sender<ChannelState>,
    shutdown: &CancellationToken,
) {
    set_state(state, ChannelState::Delivering);
    let mut buf = vec![0u8; DEBUG_INTERRUPT_SIZE];

    loop {
        let available = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = stream.peek(&mut buf) => res,
        };

        match available {
            Ok(0) => {
                log::debug!("Stub closed the interrupt connection");
                break;
            }
            Ok(n) if n == DEBUG_INTERRUPT_SIZE => match stream.read(&mut buf).await {
                Ok(read) => {
                    dispatch(&buf[..read], handler);
                    continue;
                }
                Err(e) => {
                    log::error!("Interrupt channel read failed: {}", e);
                    break;
                }
            },
            // A record is still arriving, unless the stub is gone.
            Ok(partial) => {
                if peer_hung_up(&stream).await {
                    match stream.peek(&mut buf).await {
                        Ok(n) if n == DEBUG_INTERRUPT_SIZE => continue,
                        _ => {
                            log::debug!(
                                "Stub closed the interrupt connection {} bytes into a record",
                                partial
                            );
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("Interrupt channel poll failed: {}", e);
                break;
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DebugRegisters, FloatingPointRegisters, GeneralRegisters};
    use crate::wire::encode_fixed;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    const POLL: Duration = Duration::from_millis(5);
    const WAIT: Duration = Duration::from_secs(5);

    fn record(lwpid: u32) -> DebugInterrupt {
        let mut registers = GeneralRegisters::default();
        registers.rip = 0x0040_0000 + lwpid as u64;
        let mut debug_registers = DebugRegisters::default();
        debug_registers.dr[6] = 0x4000;
        DebugInterrupt {
            lwpid,
            status: 0x057F,
            thread_name: format!("worker-{lwpid}"),
            registers,
            fp_registers: FloatingPointRegisters::default(),
            debug_registers,
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn exact_record_reaches_handler_once() {
        let expected = record(42);
        let bytes = encode_fixed(&expected);
        let mut seen = Vec::new();
        let mut handler = |interrupt: DebugInterrupt| seen.push(interrupt);

        assert!(dispatch(&bytes, &mut handler));
        assert_eq!(seen, vec![expected]);
    }

    #[test]
    fn wrong_sized_buffers_are_discarded() {
        let bytes = encode_fixed(&record(1));
        let mut calls = 0;
        let mut handler = |_: DebugInterrupt| calls += 1;

        for len in [0, 100, DEBUG_INTERRUPT_SIZE - 1] {
            assert!(!dispatch(&bytes[..len], &mut handler));
        }
        let mut long = bytes.clone();
        long.push(0);
        assert!(!dispatch(&long, &mut handler));
        assert_eq!(calls, 0);

        assert_eq!(
            decode_interrupt(&bytes[..8]),
            Err(FramingError::WrongSize {
                expected: DEBUG_INTERRUPT_SIZE,
                actual: 8
            })
        );
    }

    #[tokio::test]
    async fn delivers_records_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = InterruptChannel::listen(loopback(), POLL, move |i: DebugInterrupt| {
            let _ = tx.send(i);
        })
        .await
        .unwrap();
        assert_eq!(channel.state(), ChannelState::Listening);

        let mut stub = TcpStream::connect(channel.local_addr()).await.unwrap();
        let mut burst = encode_fixed(&record(1));
        burst.extend(encode_fixed(&record(2)));
        stub.write_all(&burst).await.unwrap();

        for lwpid in [1, 2] {
            let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(got, record(lwpid));
        }
        assert_eq!(channel.state(), ChannelState::Delivering);

        let addr = channel.local_addr();
        channel.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn waits_for_a_record_split_across_writes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = InterruptChannel::listen(loopback(), POLL, move |i: DebugInterrupt| {
            let _ = tx.send(i);
        })
        .await
        .unwrap();

        let mut stub = TcpStream::connect(channel.local_addr()).await.unwrap();
        let bytes = encode_fixed(&record(9));
        stub.write_all(&bytes[..300]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        stub.write_all(&bytes[300..]).await.unwrap();
        let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.lwpid, 9);
        assert_eq!(got.thread_name, "worker-9");

        channel.stop().await;
    }

    #[tokio::test]
    async fn stop_while_listening_returns() {
        let channel = InterruptChannel::listen(loopback(), POLL, |_: DebugInterrupt| {})
            .await
            .unwrap();
        tokio::time::timeout(WAIT, channel.stop()).await.unwrap();
    }

    async fn wait_until_stopped(channel: &InterruptChannel) {
        let mut states = channel.subscribe();
        let stopped = tokio::time::timeout(WAIT, async {
            while *states.borrow_and_update() != ChannelState::Stopped {
                if states.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(stopped.is_ok(), "channel never stopped");
        assert_eq!(channel.state(), ChannelState::Stopped);
    }

    #[tokio::test]
    async fn peer_hangup_stops_the_channel() {
        let channel = InterruptChannel::listen(loopback(), POLL, |_: DebugInterrupt| {})
            .await
            .unwrap();
        let stub = TcpStream::connect(channel.local_addr()).await.unwrap();
        drop(stub);

        wait_until_stopped(&channel).await;
        channel.stop().await;
    }

    #[tokio::test]
    async fn hangup_mid_record_stops_the_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = InterruptChannel::listen(loopback(), POLL, move |i: DebugInterrupt| {
            let _ = tx.send(i);
        })
        .await
        .unwrap();

        let mut stub = TcpStream::connect(channel.local_addr()).await.unwrap();
        stub.write_all(&encode_fixed(&record(3))[..100]).await.unwrap();
        drop(stub);

        wait_until_stopped(&channel).await;
        assert!(rx.try_recv().is_err());
        channel.stop().await;
    }

    #[tokio::test]
    async fn record_then_hangup_delivers_before_stopping() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = InterruptChannel::listen(loopback(), POLL, move |i: DebugInterrupt| {
            let _ = tx.send(i);
        })
        .await
        .unwrap();

        let mut stub = TcpStream::connect(channel.local_addr()).await.unwrap();
        let mut bytes = encode_fixed(&record(4));
        bytes.extend_from_slice(&[0u8; 16]);
        stub.write_all(&bytes).await.unwrap();
        drop(stub);

        wait_until_stopped(&channel).await;
        assert_eq!(rx.try_recv().unwrap().lwpid, 4);
        assert!(rx.try_recv().is_err());
        channel.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let err = InterruptChannel::listen(addr, POLL, |_: DebugInterrupt| {})
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
