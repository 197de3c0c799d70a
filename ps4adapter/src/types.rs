/// Records exchanged with the debug stub
///
/// Every record here mirrors a native structure of the console's x86-64
/// kernel byte for byte, reserved areas included. Layouts are described
/// field by field so they never depend on the host's struct alignment.

use serde::Serialize;

use crate::wire::{
    FixedLayout, PayloadReader, PayloadWriter, DEBUG_DBGREGS_SIZE, DEBUG_FPREGS_SIZE,
    DEBUG_INTERRUPT_SIZE, DEBUG_REGS_SIZE, DEBUG_THRINFO_SIZE, PROC_CALL_SIZE,
    PROC_LIST_ENTRY_SIZE, PROC_MAP_ENTRY_SIZE, PROC_PROC_INFO_SIZE,
};

/// General purpose thread registers (`struct reg`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    /// Exception vector number
    pub trapno: u32,
    pub fs: u16,
    pub gs: u16,
    /// Exception error code
    pub err: u32,
    pub es: u16,
    pub ds: u16,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl FixedLayout for GeneralRegisters {
    const SIZE: usize = DEBUG_REGS_SIZE;

    fn encode_into(&self, w: &mut PayloadWriter) {
        for v in [
            self.r15, self.r14, self.r13, self.r12, self.r11, self.r10, self.r9, self.r8,
            self.rdi, self.rsi, self.rbp, self.rbx, self.rdx, self.rcx, self.rax,
        ] {
            w.write_u64(v);
        }
        w.write_u32(self.trapno);
        w.write_u16(self.fs);
        w.write_u16(self.gs);
        w.write_u32(self.err);
        w.write_u16(self.es);
        w.write_u16(self.ds);
        for v in [self.rip, self.cs, self.rflags, self.rsp, self.ss] {
            w.write_u64(v);
        }
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        Self {
            r15: r.read_u64(),
            r14: r.read_u64(),
            r13: r.read_u64(),
            r12: r.read_u64(),
            r11: r.read_u64(),
            r10: r.read_u64(),
            r9: r.read_u64(),
            r8: r.read_u64(),
            rdi: r.read_u64(),
            rsi: r.read_u64(),
            rbp: r.read_u64(),
            rbx: r.read_u64(),
            rdx: r.read_u64(),
            rcx: r.read_u64(),
            rax: r.read_u64(),
            trapno: r.read_u32(),
            fs: r.read_u16(),
            gs: r.read_u16(),
            err: r.read_u32(),
            es: r.read_u16(),
            ds: r.read_u16(),
            rip: r.read_u64(),
            cs: r.read_u64(),
            rflags: r.read_u64(),
            rsp: r.read_u64(),
            ss: r.read_u64(),
        }
    }
}

/// x87/SSE environment header of the FXSAVE area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvXmm {
    pub control_word: u16,
    pub status_word: u16,
    pub tag_word: u8,
    pub zero: u8,
    /// Last executed x87 opcode (11 bits used)
    pub opcode: u16,
    pub rip: u64,
    pub rdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
}

impl EnvXmm {
    fn encode_into(&self, w: &mut PayloadWriter) {
        w.write_u16(self.control_word);
        w.write_u16(self.status_word);
        w.write_u8(self.tag_word);
        w.write_u8(self.zero);
        w.write_u16(self.opcode);
        w.write_u64(self.rip);
        w.write_u64(self.rdp);
        w.write_u32(self.mxcsr);
        w.write_u32(self.mxcsr_mask);
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        Self {
            control_word: r.read_u16(),
            status_word: r.read_u16(),
            tag_word: r.read_u8(),
            zero: r.read_u8(),
            opcode: r.read_u16(),
            rip: r.read_u64(),
            rdp: r.read_u64(),
            mxcsr: r.read_u32(),
            mxcsr_mask: r.read_u32(),
        }
    }
}

/// One 80-bit x87 register slot, padded to 16 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FpAccumulator {
    pub bytes: [u8; 10],
    pub pad: [u8; 6],
}

/// XSAVE header that follows the legacy FXSAVE area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XStateHeader {
    pub xstate_bv: u64,
    pub reserved0: [u8; 16],
    pub reserved: [u8; 40],
}

impl Default for XStateHeader {
    fn default() -> Self {
        Self {
            xstate_bv: 0,
            reserved0: [0; 16],
            reserved: [0; 40],
        }
    }
}

/// Floating point / vector state (`struct savefpu` with the AVX extension)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatingPointRegisters {
    pub env: EnvXmm,
    pub fp: [FpAccumulator; 8],
    pub xmm: [[u8; 16]; 16],
    pub pad: [u8; 96],
    pub xstate: XStateHeader,
    /// Upper 128 bits of each ymm register
    pub ymm: [[u8; 16]; 16],
}

impl Default for FloatingPointRegisters {
    fn default() -> Self {
        Self {
            env: EnvXmm::default(),
            fp: [FpAccumulator::default(); 8],
            xmm: [[0; 16]; 16],
            pad: [0; 96],
            xstate: XStateHeader::default(),
            ymm: [[0; 16]; 16],
        }
    }
}

impl FixedLayout for FloatingPointRegisters {
    const SIZE: usize = DEBUG_FPREGS_SIZE;

    fn encode_into(&self, w: &mut PayloadWriter) {
        self.env.encode_into(w);
        for acc in &self.fp {
            w.write_bytes(&acc.bytes);
            w.write_bytes(&acc.pad);
        }
        for reg in &self.xmm {
            w.write_bytes(reg);
        }
        w.write_bytes(&self.pad);
        w.write_u64(self.xstate.xstate_bv);
        w.write_bytes(&self.xstate.reserved0);
        w.write_bytes(&self.xstate.reserved);
        for reg in &self.ymm {
            w.write_bytes(reg);
        }
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        let env = EnvXmm::decode_from(r);
        let mut fp = [FpAccumulator::default(); 8];
        for acc in fp.iter_mut() {
            acc.bytes = r.read_array();
            acc.pad = r.read_array();
        }
        let mut xmm = [[0u8; 16]; 16];
        for reg in xmm.iter_mut() {
            *reg = r.read_array();
        }
        let pad = r.read_array();
        let xstate = XStateHeader {
            xstate_bv: r.read_u64(),
            reserved0: r.read_array(),
            reserved: r.read_array(),
        };
        let mut ymm = [[0u8; 16]; 16];
        for reg in ymm.iter_mut() {
            *reg = r.read_array();
        }
        Self {
            env,
            fp,
            xmm,
            pad,
            xstate,
            ymm,
        }
    }
}

/// Hardware debug registers dr0..dr15 (`struct dbreg`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugRegisters {
    pub dr: [u64; 16],
}

impl FixedLayout for DebugRegisters {
    const SIZE: usize = DEBUG_DBGREGS_SIZE;

    fn encode_into(&self, w: &mut PayloadWriter) {
        for v in self.dr {
            w.write_u64(v);
        }
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        let mut dr = [0u64; 16];
        for v in dr.iter_mut() {
            *v = r.read_u64();
        }
        Self { dr }
    }
}

/// Thread stop notification pushed on the interrupt channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInterrupt {
    pub lwpid: u32,
    pub status: u32,
    pub thread_name: String,
    pub registers: GeneralRegisters,
    pub fp_registers: FloatingPointRegisters,
    pub debug_registers: DebugRegisters,
}

impl DebugInterrupt {
    pub const THREAD_NAME_LEN: usize = 40;
}

impl FixedLayout for DebugInterrupt {
    const SIZE: usize = DEBUG_INTERRUPT_SIZE;

    fn encode_into(&self, w: &mut PayloadWriter) {
        w.write_u32(self.lwpid);
        w.write_u32(self.status);
        w.write_fixed_str(&self.thread_name, Self::THREAD_NAME_LEN);
        self.registers.encode_into(w);
        self.fp_registers.encode_into(w);
        self.debug_registers.encode_into(w);
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        Self {
            lwpid: r.read_u32(),
            status: r.read_u32(),
            thread_name: r.read_fixed_str(Self::THREAD_NAME_LEN),
            registers: GeneralRegisters::decode_from(r),
            fp_registers: FloatingPointRegisters::decode_from(r),
            debug_registers: DebugRegisters::decode_from(r),
        }
    }
}

/// Detailed description of a process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
    pub path: String,
    pub title_id: String,
    pub content_id: String,
}

impl FixedLayout for ProcessInfo {
    const SIZE: usize = PROC_PROC_INFO_SIZE;

    fn encode_into(&self, w: &mut PayloadWriter) {
        w.write_i32(self.pid);
        w.write_fixed_str(&self.name, 40);
        w.write_fixed_str(&self.path, 64);
        w.write_fixed_str(&self.title_id, 16);
        w.write_fixed_str(&self.content_id, 64);
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        Self {
            pid: r.read_i32(),
            name: r.read_fixed_str(40),
            path: r.read_fixed_str(64),
            title_id: r.read_fixed_str(16),
            content_id: r.read_fixed_str(64),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub pid: i32,
    pub priority: i32,
    pub name: String,
}

impl FixedLayout for ThreadInfo {
    const SIZE: usize = DEBUG_THRINFO_SIZE;

    fn encode_into(&self, w: &mut PayloadWriter) {
        w.write_i32(self.pid);
        w.write_i32(self.priority);
        w.write_fixed_str(&self.name, 32);
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        Self {
            pid: r.read_i32(),
            priority: r.read_i32(),
            name: r.read_fixed_str(32),
        }
    }
}

/// One row of the process list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessEntry {
    pub name: String,
    pub pid: i32,
}

impl FixedLayout for ProcessEntry {
    const SIZE: usize = PROC_LIST_ENTRY_SIZE;

    fn encode_into(&self, w: &mut PayloadWriter) {
        w.write_fixed_str(&self.name, 32);
        w.write_i32(self.pid);
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        Self {
            name: r.read_fixed_str(32),
            pid: r.read_i32(),
        }
    }
}

impl std::fmt::Display for ProcessEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.pid, self.name)
    }
}

/// One virtual memory mapping of a process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryEntry {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub prot: u16,
}

impl MemoryEntry {
    pub fn size(&self) -> u64 {
        self.end.wrapping_sub(self.start)
    }
}

impl FixedLayout for MemoryEntry {
    const SIZE: usize = PROC_MAP_ENTRY_SIZE;

    fn encode_into(&self, w: &mut PayloadWriter) {
        w.write_fixed_str(&self.name, 32);
        w.write_u64(self.start);
        w.write_u64(self.end);
        w.write_u64(self.offset);
        w.write_u16(self.prot);
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        Self {
            name: r.read_fixed_str(32),
            start: r.read_u64(),
            end: r.read_u64(),
            offset: r.read_u64(),
            prot: r.read_u16(),
        }
    }
}

/// Result of a remote procedure call through an installed RPC stub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcCallResult {
    pub pid: i32,
    pub rax: u64,
}

impl FixedLayout for RpcCallResult {
    const SIZE: usize = PROC_CALL_SIZE;

    fn encode_into(&self, w: &mut PayloadWriter) {
        w.write_i32(self.pid);
        w.write_u64(self.rax);
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Self {
        Self {
            pid: r.read_i32(),
            rax: r.read_u64(),
        }
    }
}

/// Processes running on the console
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessList {
    pub processes: Vec<ProcessEntry>,
}

impl ProcessList {
    /// Finds a process by exact name, or by substring when `contains` is set.
    pub fn find_process(&self, name: &str, contains: bool) -> Option<&ProcessEntry> {
        self.processes.iter().find(|p| {
            if contains {
                p.name.contains(name)
            } else {
                p.name == name
            }
        })
    }
}

/// Memory layout of one process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessMap {
    pub pid: i32,
    pub entries: Vec<MemoryEntry>,
}

impl ProcessMap {
    pub fn find_entry(&self, name: &str, contains: bool) -> Option<&MemoryEntry> {
        self.entries.iter().find(|e| {
            if contains {
                e.name.contains(name)
            } else {
                e.name == name
            }
        })
    }

    pub fn find_entry_by_size(&self, size: u64) -> Option<&MemoryEntry> {
        self.entries.iter().find(|e| e.size() == size)
    }
}

/// Page protection bits (`vm_prot_t`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmProtection(pub u32);

impl VmProtection {
    pub const NONE: Self = Self(0x00);
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x02);
    pub const EXECUTE: Self = Self(0x04);
    pub const DEFAULT: Self = Self(0x01 | 0x02);
    pub const ALL: Self = Self(0x01 | 0x02 | 0x04);
    pub const NO_CHANGE: Self = Self(0x08);
    pub const COPY: Self = Self(0x10);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for VmProtection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Watched length, in the encoding of the DR7 LEN field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WatchpointLength {
    Byte = 0x00,
    Word = 0x01,
    Qword = 0x02,
    Dword = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WatchpointBreakType {
    Execute = 0x00,
    Write = 0x01,
    ReadWrite = 0x03,
}

/// Operation carried by the stop/go command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StopGo {
    Resume = 0,
    Stop = 1,
    Kill = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanCompareType {
    ExactValue = 0,
    FuzzyValue,
    BiggerThan,
    SmallerThan,
    ValueBetween,
    IncreasedValue,
    IncreasedValueBy,
    DecreasedValue,
    DecreasedValueBy,
    ChangedValue,
    UnchangedValue,
    UnknownInitialValue,
}

/// A typed value to search for in process memory
#[derive(Debug, Clone, PartialEq)]
pub enum ScanValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bytes(Vec<u8>),
    Text(String),
}

impl ScanValue {
    /// Wire tag of the value type
    pub fn type_tag(&self) -> u8 {
        match self {
            ScanValue::U8(_) => 0,
            ScanValue::I8(_) => 1,
            ScanValue::U16(_) => 2,
            ScanValue::I16(_) => 3,
            ScanValue::U32(_) => 4,
            ScanValue::I32(_) => 5,
            ScanValue::U64(_) => 6,
            ScanValue::I64(_) => 7,
            ScanValue::F32(_) => 8,
            ScanValue::F64(_) => 9,
            ScanValue::Bytes(_) => 10,
            ScanValue::Text(_) => 11,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ScanValue::U8(v) => v.to_le_bytes().to_vec(),
            ScanValue::I8(v) => v.to_le_bytes().to_vec(),
            ScanValue::U16(v) => v.to_le_bytes().to_vec(),
            ScanValue::I16(v) => v.to_le_bytes().to_vec(),
            ScanValue::U32(v) => v.to_le_bytes().to_vec(),
            ScanValue::I32(v) => v.to_le_bytes().to_vec(),
            ScanValue::U64(v) => v.to_le_bytes().to_vec(),
            ScanValue::I64(v) => v.to_le_bytes().to_vec(),
            ScanValue::F32(v) => v.to_le_bytes().to_vec(),
            ScanValue::F64(v) => v.to_le_bytes().to_vec(),
            ScanValue::Bytes(v) => v.clone(),
            ScanValue::Text(s) => s.as_bytes().to_vec(),
        }
    }
}
