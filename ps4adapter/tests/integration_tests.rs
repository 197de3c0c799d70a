/// Integration tests for the PS4 debug client
///
/// These run the client against an in-process stub over real loopback sockets.

mod support;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ps4adapter::wire::encode_fixed;
use ps4adapter::*;
use support::{free_local_addr, MockStub, StubEvent, STUB_RIP};
use tokio::sync::mpsc;

async fn setup() -> (MockStub, Ps4Debugger) {
    let interrupt_bind = free_local_addr();
    let stub = MockStub::start(interrupt_bind).await;
    let config = DebuggerConfig {
        port: stub.port(),
        interrupt_bind,
        poll_interval: Duration::from_millis(10),
        ..DebuggerConfig::default()
    };
    let mut ps4 = Ps4Debugger::with_config(IpAddr::V4(Ipv4Addr::LOCALHOST), config);
    ps4.connect().await.unwrap();
    (stub, ps4)
}

fn sample_interrupt(lwpid: u32) -> DebugInterrupt {
    DebugInterrupt {
        lwpid,
        status: 0x057F,
        thread_name: "GameMainThread".into(),
        registers: GeneralRegisters {
            rip: 0x0040_2000,
            ..GeneralRegisters::default()
        },
        fp_registers: FloatingPointRegisters::default(),
        debug_registers: DebugRegisters::default(),
    }
}

#[tokio::test]
async fn test_version_and_process_list() {
    let (stub, mut ps4) = setup().await;

    assert_eq!(ps4.get_console_debug_version().await.unwrap(), "1.2");
    let list = ps4.get_process_list().await.unwrap();
    let game = list.find_process("eboot", true).unwrap();
    assert_eq!(game.pid, 77);
    assert_eq!(game.to_string(), "[77] eboot.bin");

    ps4.disconnect().await.unwrap();
    assert!(!ps4.is_connected());
    stub.wait_for(StubEvent::Command(Command::ConsoleEnd)).await;
    assert_eq!(
        stub.commands(),
        vec![Command::Version, Command::ProcList, Command::ConsoleEnd]
    );
}

#[tokio::test]
async fn test_attach_listens_before_the_stub_connects() {
    let (stub, mut ps4) = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    ps4.attach_debugger(77, move |interrupt: DebugInterrupt| {
        let _ = tx.send(interrupt);
    })
    .await
    .unwrap();

    assert_eq!(
        stub.events(),
        vec![
            StubEvent::Command(Command::DebugAttach),
            StubEvent::InterruptConnected
        ]
    );
    assert!(ps4.is_debugging());

    stub.push_interrupt(&encode_fixed(&sample_interrupt(100))).await;
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, sample_interrupt(100));
    assert_eq!(ps4.interrupt_state(), Some(ChannelState::Delivering));

    assert_eq!(ps4.get_thread_list().await.unwrap(), vec![100, 101]);
    assert_eq!(ps4.get_registers(100).await.unwrap().rip, STUB_RIP);
}

#[tokio::test]
async fn test_split_interrupt_is_delivered_once() {
    let (stub, mut ps4) = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    ps4.attach_debugger(77, move |interrupt: DebugInterrupt| {
        let _ = tx.send(interrupt);
    })
    .await
    .unwrap();

    let bytes = encode_fixed(&sample_interrupt(5));
    stub.push_interrupt(&bytes[..100]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    // The rest of the record completes it.
    stub.push_interrupt(&bytes[100..]).await;
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.lwpid, 5);
}

#[tokio::test]
async fn test_breakpoint_index_checked_before_sending() {
    let (stub, mut ps4) = setup().await;
    ps4.attach_debugger(77, |_: DebugInterrupt| {}).await.unwrap();

    let err = ps4.change_breakpoint(10, true, 0x1000).await.unwrap_err();
    assert!(matches!(
        err,
        DebugError::Usage(UsageError::BreakpointIndexOutOfRange {
            index: 10,
            capacity: 10
        })
    ));
    let err = ps4
        .change_watchpoint(
            4,
            true,
            WatchpointLength::Dword,
            WatchpointBreakType::Write,
            0x2000,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DebugError::Usage(UsageError::WatchpointIndexOutOfRange { .. })
    ));
    assert!(ps4.is_connected());

    ps4.change_breakpoint(9, true, 0x1000).await.unwrap();
    assert_eq!(
        stub.commands(),
        vec![Command::DebugAttach, Command::DebugBreakpoint]
    );
}

#[tokio::test]
async fn test_detach_stops_channel_after_the_command() {
    let (stub, mut ps4) = setup().await;
    ps4.attach_debugger(77, |_: DebugInterrupt| {}).await.unwrap();

    ps4.detach_debugger().await.unwrap();
    assert_eq!(ps4.phase(), SessionPhase::Connected);
    assert_eq!(ps4.interrupt_state(), None);

    let closed = stub.wait_for(StubEvent::InterruptClosed).await;
    let detach = stub
        .wait_for(StubEvent::Command(Command::DebugDetach))
        .await;
    assert!(detach < closed);

    // The interrupt port is free again.
    ps4.attach_debugger(77, |_: DebugInterrupt| {}).await.unwrap();
    assert!(ps4.is_debugging());
}

#[tokio::test]
async fn test_close_detaches_then_disconnects() {
    let (stub, mut ps4) = setup().await;
    ps4.attach_debugger(77, |_: DebugInterrupt| {}).await.unwrap();
    ps4.print("attached").await.unwrap();

    ps4.close().await.unwrap();
    stub.wait_for(StubEvent::InterruptClosed).await;
    stub.wait_for(StubEvent::Command(Command::ConsoleEnd)).await;
    assert_eq!(
        stub.commands(),
        vec![
            Command::DebugAttach,
            Command::ConsolePrint,
            Command::DebugDetach,
            Command::ConsoleEnd
        ]
    );
}

#[tokio::test]
async fn test_refused_connection() {
    let closed = free_local_addr();
    let config = DebuggerConfig {
        port: closed.port(),
        ..DebuggerConfig::default()
    };
    let mut ps4 = Ps4Debugger::with_config(closed.ip(), config);

    let err = ps4.connect().await.unwrap_err();
    assert!(matches!(err, DebugError::Transport(_)));
    assert!(!ps4.is_connected());
}
