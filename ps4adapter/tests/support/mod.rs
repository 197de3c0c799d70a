/// In-process stand-in for the debug stub
///
/// Serves one command connection on loopback and records what it sees, so
/// tests can assert on the order of commands and interrupt channel activity.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ps4adapter::wire::{decode_header, encode_fixed, CMD_PACKET_SIZE};
use ps4adapter::{Command, GeneralRegisters, ProcessEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

const SUCCESS: [u8; 4] = 0x8000_0000u32.to_le_bytes();

pub const STUB_RIP: u64 = 0x0040_1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubEvent {
    Command(Command),
    InterruptConnected,
    InterruptRefused,
    InterruptClosed,
}

type Events = Arc<Mutex<Vec<StubEvent>>>;
type InterruptWriter = Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>;

pub struct MockStub {
    addr: SocketAddr,
    events: Events,
    interrupt: InterruptWriter,
}

/// A loopback address nothing is listening on.
pub fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn record(events: &Events, event: StubEvent) {
    events.lock().unwrap().push(event);
}

impl MockStub {
    /// Start serving; on attach the stub connects back to `interrupt_addr`.
    pub async fn start(interrupt_addr: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events: Events = Arc::default();
        let interrupt: InterruptWriter = Arc::default();

        tokio::spawn(serve(
            listener,
            interrupt_addr,
            events.clone(),
            interrupt.clone(),
        ));

        MockStub {
            addr,
            events,
            interrupt,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn events(&self) -> Vec<StubEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                StubEvent::Command(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// Wait until `event` has been recorded and return its position.
    pub async fn wait_for(&self, event: StubEvent) -> usize {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(pos) = self.events().iter().position(|e| *e == event) {
                return pos;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "stub never recorded {event:?}; saw {:?}",
                self.events()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Write raw bytes on the interrupt connection.
    pub async fn push_interrupt(&self, bytes: &[u8]) {
        let mut writer = self.interrupt.lock().await;
        let writer = writer.as_mut().expect("interrupt channel not connected");
        writer.write_all(bytes).await.unwrap();
    }
}

async fn serve(
    listener: TcpListener,
    interrupt_addr: SocketAddr,
    events: Events,
    interrupt: InterruptWriter,
) {
    let (mut stream, _) = listener.accept().await.unwrap();

    loop {
        let mut header = [0u8; CMD_PACKET_SIZE];
        if stream.read_exact(&mut header).await.is_err() {
            break;
        }
        let header = decode_header(&header);
        let mut payload = vec![0u8; header.data_len as usize];
        stream.read_exact(&mut payload).await.unwrap();
        let Some(command) = header.command() else {
            break;
        };
        record(&events, StubEvent::Command(command));

        match command {
            Command::Version => {
                stream.write_all(&4i32.to_le_bytes()).await.unwrap();
                stream.write_all(b"1.2\0").await.unwrap();
            }
            Command::ConsoleEnd => break,
            Command::ConsolePrint => {
                let len = i32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
                let mut text = vec![0u8; len];
                stream.read_exact(&mut text).await.unwrap();
                stream.write_all(&SUCCESS).await.unwrap();
            }
            Command::ProcList => {
                let mut body = SUCCESS.to_vec();
                body.extend(2i32.to_le_bytes());
                for (name, pid) in [("SceShellCore", 38), ("eboot.bin", 77)] {
                    body.extend(encode_fixed(&ProcessEntry {
                        name: name.into(),
                        pid,
                    }));
                }
                stream.write_all(&body).await.unwrap();
            }
            Command::DebugAttach => {
                match TcpStream::connect(interrupt_addr).await {
                    Ok(conn) => {
                        record(&events, StubEvent::InterruptConnected);
                        let (mut read_half, write_half) = conn.into_split();
                        *interrupt.lock().await = Some(write_half);
                        let events = events.clone();
                        tokio::spawn(async move {
                            let mut sink = [0u8; 64];
                            while let Ok(n) = read_half.read(&mut sink).await {
                                if n == 0 {
                                    break;
                                }
                            }
                            record(&events, StubEvent::InterruptClosed);
                        });
                    }
                    Err(_) => record(&events, StubEvent::InterruptRefused),
                }
                stream.write_all(&SUCCESS).await.unwrap();
            }
            Command::DebugThreads => {
                let mut body = SUCCESS.to_vec();
                body.extend(2i32.to_le_bytes());
                body.extend(100u32.to_le_bytes());
                body.extend(101u32.to_le_bytes());
                stream.write_all(&body).await.unwrap();
            }
            Command::DebugGetRegs => {
                let regs = GeneralRegisters {
                    rip: STUB_RIP,
                    ..GeneralRegisters::default()
                };
                let mut body = SUCCESS.to_vec();
                body.extend(encode_fixed(&regs));
                stream.write_all(&body).await.unwrap();
            }
            _ => stream.write_all(&SUCCESS).await.unwrap(),
        }
    }
}
