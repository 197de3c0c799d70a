/// Process commands
///
/// Memory access, maps, remote calls and memory scans on processes running
/// on the console. None of these require an attached debugger.

use crate::session::wire_len;
use crate::wire::{decode_fixed, FixedLayout, PayloadWriter, SCAN_RESULT_END};
use crate::{
    Command, MemoryEntry, ProcessEntry, ProcessInfo, ProcessList, ProcessMap, Ps4Debugger,
    Result, RpcCallResult, ScanCompareType, ScanValue, UsageError, VmProtection,
};

/// Argument slots of a remote call.
pub const RPC_MAX_ARGS: usize = 6;

fn memory_payload(pid: i32, address: u64, length: usize) -> Result<Vec<u8>> {
    let mut w = PayloadWriter::with_capacity(16);
    w.write_i32(pid);
    w.write_u64(address);
    w.write_i32(wire_len(length)?);
    Ok(w.into_vec())
}

fn pid_payload(pid: i32) -> Vec<u8> {
    pid.to_le_bytes().to_vec()
}

impl Ps4Debugger {
    /// List every process running on the console.
    pub async fn get_process_list(&mut self) -> Result<ProcessList> {
        let mut ex = self.exchange(Command::ProcList)?;
        ex.send_packet(&[]).await?;
        ex.check_status().await?;
        let count = ex.recv_count().await?;
        let processes: Vec<ProcessEntry> = ex.recv_records(count).await?;
        log::debug!("Process list: {} entries", processes.len());
        Ok(ProcessList { processes })
    }

    /// Read `length` bytes at `address` in `pid`.
    pub async fn read_memory(&mut self, pid: i32, address: u64, length: usize) -> Result<Vec<u8>> {
        let payload = memory_payload(pid, address, length)?;
        self.call_returning_sized(Command::ProcRead, &payload, length)
            .await
    }

    /// Read one fixed-layout value at `address`.
    pub async fn read_value<T: FixedLayout>(&mut self, pid: i32, address: u64) -> Result<T> {
        let bytes = self.read_memory(pid, address, T::SIZE).await?;
        Ok(decode_fixed(&bytes))
    }

    /// Write `data` at `address` in `pid`.
    pub async fn write_memory(&mut self, pid: i32, address: u64, data: &[u8]) -> Result<()> {
        let payload = memory_payload(pid, address, data.len())?;
        self.call_uploading(Command::ProcWrite, &payload, data).await
    }

    /// Virtual memory map of `pid`.
    pub async fn get_process_maps(&mut self, pid: i32) -> Result<ProcessMap> {
        let mut ex = self.exchange(Command::ProcMaps)?;
        ex.send_packet(&pid_payload(pid)).await?;
        ex.check_status().await?;
        let count = ex.recv_count().await?;
        let entries: Vec<MemoryEntry> = ex.recv_records(count).await?;
        Ok(ProcessMap { pid, entries })
    }

    /// Install the remote call stub in `pid`, returning its address.
    pub async fn install_rpc(&mut self, pid: i32) -> Result<u64> {
        let stub = self
            .call_returning::<u64>(Command::ProcInstall, &pid_payload(pid))
            .await?;
        log::debug!("RPC stub for pid {} at 0x{:X}", pid, stub);
        Ok(stub)
    }

    /// Call the function at `address` inside `pid` through an installed stub.
    ///
    /// Unused argument slots are sent as zero.
    pub async fn rpc_call(
        &mut self,
        pid: i32,
        rpc_stub: u64,
        address: u64,
        args: &[u64],
    ) -> Result<RpcCallResult> {
        if args.len() > RPC_MAX_ARGS {
            return Err(UsageError::TooManyArguments {
                given: args.len(),
                max: RPC_MAX_ARGS,
            }
            .into());
        }
        let mut w = PayloadWriter::with_capacity(68);
        w.write_i32(pid);
        w.write_u64(rpc_stub);
        w.write_u64(address);
        for slot in 0..RPC_MAX_ARGS {
            w.write_u64(args.get(slot).copied().unwrap_or(0));
        }
        self.call_returning(Command::ProcCall, &w.into_vec()).await
    }

    /// Load and run an ELF image inside `pid`.
    pub async fn load_elf(&mut self, pid: i32, elf: &[u8]) -> Result<()> {
        let mut w = PayloadWriter::with_capacity(8);
        w.write_i32(pid);
        w.write_u32(wire_len(elf.len())? as u32);
        self.call_uploading(Command::ProcElf, &w.into_vec(), elf)
            .await
    }

    /// Change the protection of a range in `pid`.
    pub async fn change_protection(
        &mut self,
        pid: i32,
        address: u64,
        length: u32,
        prot: VmProtection,
    ) -> Result<()> {
        let mut w = PayloadWriter::with_capacity(20);
        w.write_i32(pid);
        w.write_u64(address);
        w.write_u32(length);
        w.write_u32(prot.bits());
        self.call(Command::ProcProtect, &w.into_vec()).await
    }

    pub async fn get_process_info(&mut self, pid: i32) -> Result<ProcessInfo> {
        self.call_returning(Command::ProcInfo, &pid_payload(pid))
            .await
    }

    /// Allocate `length` bytes in `pid`, returning the address.
    pub async fn allocate_memory(&mut self, pid: i32, length: usize) -> Result<u64> {
        let mut w = PayloadWriter::with_capacity(8);
        w.write_i32(pid);
        w.write_i32(wire_len(length)?);
        self.call_returning(Command::ProcAlloc, &w.into_vec()).await
    }

    /// Release memory obtained from [`Ps4Debugger::allocate_memory`].
    pub async fn free_memory(&mut self, pid: i32, address: u64, length: usize) -> Result<()> {
        let payload = memory_payload(pid, address, length)?;
        self.call(Command::ProcFree, &payload).await
    }

    /// Search the memory of `pid` for `value`.
    ///
    /// `extra` is the second operand of range and "by" comparisons and must
    /// be of the same type. The stub streams matching addresses until a
    /// terminator, which can take far longer than the receive timeout, so
    /// the result stream is read without one.
    pub async fn scan_process(
        &mut self,
        pid: i32,
        compare: ScanCompareType,
        value: &ScanValue,
        extra: Option<&ScanValue>,
    ) -> Result<Vec<u64>> {
        let value_bytes = value.to_bytes();
        let extra_bytes = match extra {
            Some(extra) => {
                let bytes = extra.to_bytes();
                if extra.type_tag() != value.type_tag() || bytes.len() != value_bytes.len() {
                    return Err(UsageError::MismatchedScanValues.into());
                }
                Some(bytes)
            }
            None => None,
        };
        let total = value_bytes.len() + extra_bytes.as_ref().map_or(0, Vec::len);

        let mut w = PayloadWriter::with_capacity(10);
        w.write_i32(pid);
        w.write_u8(value.type_tag());
        w.write_u8(compare as u8);
        w.write_i32(wire_len(total)?);

        let mut ex = self.exchange(Command::ProcScan)?;
        ex.send_packet(&w.into_vec()).await?;
        ex.check_status().await?;
        ex.send_data(&value_bytes).await?;
        if let Some(extra_bytes) = &extra_bytes {
            ex.send_data(extra_bytes).await?;
        }
        ex.check_status().await?;

        let mut results = Vec::new();
        loop {
            let bytes = ex.recv_data_unbounded(u64::SIZE).await?;
            let address: u64 = decode_fixed(&bytes);
            if address == SCAN_RESULT_END {
                break;
            }
            results.push(address);
        }
        log::debug!("Scan of pid {} found {} addresses", pid, results.len());
        Ok(results)
    }
}
