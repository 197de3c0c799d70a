/// Wire codec for the debug stub protocol
///
/// Every request starts with a fixed 12-byte command header, optionally
/// followed by an opcode-specific payload. Every field on the wire is
/// little-endian and fields are packed back to back with no padding.

use std::fmt;

/// Magic value leading every command header.
pub const CMD_PACKET_MAGIC: u32 = 0xFFAA_BBCC;
pub const CMD_PACKET_SIZE: usize = 12;
pub const STATUS_SIZE: usize = 4;

/// Largest chunk handed to a single socket read or write.
pub const NET_MAX_LENGTH: usize = 8192;
/// Largest payload that may follow a command header.
pub const MAX_COMMAND_PAYLOAD: usize = 0x2000;

pub const MAX_BREAKPOINTS: u32 = 10;
pub const MAX_WATCHPOINTS: u32 = 4;

pub const DEBUG_INTERRUPT_SIZE: usize = 0x4A0;
pub const DEBUG_THRINFO_SIZE: usize = 40;
pub const DEBUG_REGS_SIZE: usize = 0xB0;
pub const DEBUG_FPREGS_SIZE: usize = 0x340;
pub const DEBUG_DBGREGS_SIZE: usize = 0x80;

pub const PROC_LIST_ENTRY_SIZE: usize = 36;
pub const PROC_MAP_ENTRY_SIZE: usize = 58;
pub const PROC_CALL_SIZE: usize = 12;
pub const PROC_PROC_INFO_SIZE: usize = 188;
pub const KERN_BASE_SIZE: usize = 8;

/// Terminates the address stream returned by a process scan.
pub const SCAN_RESULT_END: u64 = u64::MAX;

/// Remote operation identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Version = 0xBD00_0001,

    ProcList = 0xBDAA_0001,
    ProcRead = 0xBDAA_0002,
    ProcWrite = 0xBDAA_0003,
    ProcMaps = 0xBDAA_0004,
    ProcInstall = 0xBDAA_0005,
    ProcCall = 0xBDAA_0006,
    ProcElf = 0xBDAA_0007,
    ProcProtect = 0xBDAA_0008,
    ProcScan = 0xBDAA_0009,
    ProcInfo = 0xBDAA_000A,
    ProcAlloc = 0xBDAA_000B,
    ProcFree = 0xBDAA_000C,

    DebugAttach = 0xBDBB_0001,
    DebugDetach = 0xBDBB_0002,
    DebugBreakpoint = 0xBDBB_0003,
    DebugWatchpoint = 0xBDBB_0004,
    DebugThreads = 0xBDBB_0005,
    DebugStopThread = 0xBDBB_0006,
    DebugResumeThread = 0xBDBB_0007,
    DebugGetRegs = 0xBDBB_0008,
    DebugSetRegs = 0xBDBB_0009,
    DebugGetFpRegs = 0xBDBB_000A,
    DebugSetFpRegs = 0xBDBB_000B,
    DebugGetDbRegs = 0xBDBB_000C,
    DebugSetDbRegs = 0xBDBB_000D,
    DebugStopGo = 0xBDBB_0010,
    DebugThreadInfo = 0xBDBB_0011,
    DebugSingleStep = 0xBDBB_0012,

    KernBase = 0xBDCC_0001,
    KernRead = 0xBDCC_0002,
    KernWrite = 0xBDCC_0003,

    ConsoleReboot = 0xBDDD_0001,
    ConsoleEnd = 0xBDDD_0002,
    ConsolePrint = 0xBDDD_0003,
    ConsoleNotify = 0xBDDD_0004,
    ConsoleInfo = 0xBDDD_0005,
}

impl Command {
    pub const ALL: [Command; 37] = [
        Command::Version,
        Command::ProcList,
        Command::ProcRead,
        Command::ProcWrite,
        Command::ProcMaps,
        Command::ProcInstall,
        Command::ProcCall,
        Command::ProcElf,
        Command::ProcProtect,
        Command::ProcScan,
        Command::ProcInfo,
        Command::ProcAlloc,
        Command::ProcFree,
        Command::DebugAttach,
        Command::DebugDetach,
        Command::DebugBreakpoint,
        Command::DebugWatchpoint,
        Command::DebugThreads,
        Command::DebugStopThread,
        Command::DebugResumeThread,
        Command::DebugGetRegs,
        Command::DebugSetRegs,
        Command::DebugGetFpRegs,
        Command::DebugSetFpRegs,
        Command::DebugGetDbRegs,
        Command::DebugSetDbRegs,
        Command::DebugStopGo,
        Command::DebugThreadInfo,
        Command::DebugSingleStep,
        Command::KernBase,
        Command::KernRead,
        Command::KernWrite,
        Command::ConsoleReboot,
        Command::ConsoleEnd,
        Command::ConsolePrint,
        Command::ConsoleNotify,
        Command::ConsoleInfo,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|cmd| cmd.as_u32() == raw)
    }

    /// Commands of the debug group that only make sense with a process attached.
    ///
    /// Attach and detach themselves are excluded: attach starts the session and
    /// the stub accepts a detach at any time.
    pub fn requires_debugging(self) -> bool {
        (self.as_u32() & 0xFFFF_0000) == 0xBDBB_0000
            && !matches!(self, Command::DebugAttach | Command::DebugDetach)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:08X})", self, self.as_u32())
    }
}

/// Result word sent by the stub after it has read a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Error,
    TooMuchData,
    DataNull,
    AlreadyDebugging,
    InvalidIndex,
    /// A value outside the known set. Treated as a failure.
    Unrecognized(u32),
}

impl CommandStatus {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0x8000_0000 => CommandStatus::Success,
            0xF000_0001 => CommandStatus::Error,
            0xF000_0002 => CommandStatus::TooMuchData,
            0xF000_0003 => CommandStatus::DataNull,
            0xF000_0004 => CommandStatus::AlreadyDebugging,
            0xF000_0005 => CommandStatus::InvalidIndex,
            other => CommandStatus::Unrecognized(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            CommandStatus::Success => 0x8000_0000,
            CommandStatus::Error => 0xF000_0001,
            CommandStatus::TooMuchData => 0xF000_0002,
            CommandStatus::DataNull => 0xF000_0003,
            CommandStatus::AlreadyDebugging => 0xF000_0004,
            CommandStatus::InvalidIndex => 0xF000_0005,
            CommandStatus::Unrecognized(raw) => raw,
        }
    }

    pub fn is_success(self) -> bool {
        self == CommandStatus::Success
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandStatus::Success => "CMD_SUCCESS",
            CommandStatus::Error => "CMD_ERROR",
            CommandStatus::TooMuchData => "CMD_TOO_MUCH_DATA",
            CommandStatus::DataNull => "CMD_DATA_NULL",
            CommandStatus::AlreadyDebugging => "CMD_ALREADY_DEBUG",
            CommandStatus::InvalidIndex => "CMD_INVALID_INDEX",
            CommandStatus::Unrecognized(_) => "CMD_UNKNOWN",
        };
        write!(f, "{} (0x{:08X})", name, self.as_u32())
    }
}

/// Decoded form of the 12-byte command header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub magic: u32,
    pub command: u32,
    pub data_len: u32,
}

impl CommandHeader {
    pub fn command(&self) -> Option<Command> {
        Command::from_u32(self.command)
    }
}

pub fn encode_header(command: Command, payload_length: u32) -> [u8; CMD_PACKET_SIZE] {
    let mut out = [0u8; CMD_PACKET_SIZE];
    out[0..4].copy_from_slice(&CMD_PACKET_MAGIC.to_le_bytes());
    out[4..8].copy_from_slice(&command.as_u32().to_le_bytes());
    out[8..12].copy_from_slice(&payload_length.to_le_bytes());
    out
}

pub fn decode_header(bytes: &[u8; CMD_PACKET_SIZE]) -> CommandHeader {
    let mut r = PayloadReader::new(bytes);
    CommandHeader {
        magic: r.read_u32(),
        command: r.read_u32(),
        data_len: r.read_u32(),
    }
}

/// Builds a request payload field by field.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes `s` into a `width`-byte field.
    ///
    /// The text is cut short so that at least one terminating zero always
    /// fits; the rest of the field is zero-filled.
    pub fn write_fixed_str(&mut self, s: &str, width: usize) {
        let bytes = s.as_bytes();
        let len = bytes.len().min(width.saturating_sub(1));
        self.buf.extend_from_slice(&bytes[..len]);
        self.buf.resize(self.buf.len() + (width - len), 0);
    }
}

/// Cursor over a response buffer.
///
/// Callers size the buffer before decoding, so reading past the end is a
/// bug in the record description and panics.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let end = self.pos + n;
        assert!(
            end <= self.buf.len(),
            "read of {n} bytes at offset {} overruns a {}-byte buffer",
            self.pos,
            self.buf.len()
        );
        let out = &self.buf[self.pos..end];
        self.pos = end;
        out
    }

    pub fn read_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N));
        out
    }

    pub fn read_u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    pub fn read_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.read_array())
    }

    pub fn read_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.read_array())
    }

    pub fn read_i32(&mut self) -> i32 {
        i32::from_le_bytes(self.read_array())
    }

    pub fn read_u64(&mut self) -> u64 {
        u64::from_le_bytes(self.read_array())
    }

    /// Reads a `width`-byte text field, stopping at the first zero byte.
    pub fn read_fixed_str(&mut self, width: usize) -> String {
        read_nul_terminated(self.take(width))
    }
}

/// Text up to (not including) the first zero byte. Bytes after it are ignored.
pub fn read_nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A record with a byte-exact layout shared with the stub.
pub trait FixedLayout: Sized {
    const SIZE: usize;

    fn encode_into(&self, w: &mut PayloadWriter);

    fn decode_from(r: &mut PayloadReader<'_>) -> Self;
}

pub fn encode_fixed<T: FixedLayout>(record: &T) -> Vec<u8> {
    let mut w = PayloadWriter::with_capacity(T::SIZE);
    record.encode_into(&mut w);
    assert_eq!(w.len(), T::SIZE, "record encoded to the wrong size");
    w.into_vec()
}

/// Decodes one record from a buffer of exactly `T::SIZE` bytes.
///
/// A length mismatch is a programming error, not a protocol condition.
pub fn decode_fixed<T: FixedLayout>(bytes: &[u8]) -> T {
    assert_eq!(
        bytes.len(),
        T::SIZE,
        "fixed-layout record needs exactly {} bytes",
        T::SIZE
    );
    let mut r = PayloadReader::new(bytes);
    T::decode_from(&mut r)
}

impl FixedLayout for u32 {
    const SIZE: usize = 4;

    fn encode_into(&self, w: &mut PayloadWriter) {
        w.write_u32(*self);
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        r.read_u32()
    }
}

impl FixedLayout for u64 {
    const SIZE: usize = 8;

    fn encode_into(&self, w: &mut PayloadWriter) {
        w.write_u64(*self);
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        r.read_u64()
    }
}
