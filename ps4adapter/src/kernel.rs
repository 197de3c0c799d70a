/// Kernel commands
///
/// Direct access to kernel memory. The stub performs these without any
/// process being attached.

use crate::session::wire_len;
use crate::wire::PayloadWriter;
use crate::{Command, Ps4Debugger, Result};

fn range_payload(address: u64, length: usize) -> Result<Vec<u8>> {
    let mut w = PayloadWriter::with_capacity(12);
    w.write_u64(address);
    w.write_i32(wire_len(length)?);
    Ok(w.into_vec())
}

impl Ps4Debugger {
    /// Load address of the running kernel.
    pub async fn kernel_base(&mut self) -> Result<u64> {
        self.call_returning(Command::KernBase, &[]).await
    }

    /// Read `length` bytes of kernel memory at `address`.
    pub async fn kernel_read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>> {
        let payload = range_payload(address, length)?;
        self.call_returning_sized(Command::KernRead, &payload, length)
            .await
    }

    /// Write `data` to kernel memory at `address`.
    pub async fn kernel_write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let payload = range_payload(address, data.len())?;
        self.call_uploading(Command::KernWrite, &payload, data).await
    }
}
