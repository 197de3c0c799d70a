/// Console commands
///
/// Version, end and reboot are answered without a status word. Print and
/// notify send their header, then the text, then read one status.

use crate::session::wire_len;
use crate::wire::{read_nul_terminated, PayloadWriter};
use crate::{Command, Ps4Debugger, Result, LIBRARY_VERSION};

/// Text as the stub expects it: bytes followed by a terminating zero.
fn terminated(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    bytes
}

impl Ps4Debugger {
    /// Protocol version this library speaks.
    pub fn get_library_debug_version(&self) -> &'static str {
        LIBRARY_VERSION
    }

    /// Version string reported by the stub.
    pub async fn get_console_debug_version(&mut self) -> Result<String> {
        let mut ex = self.exchange(Command::Version)?;
        ex.send_packet(&[]).await?;
        let len = ex.recv_count().await?;
        let data = ex.recv_data(len).await?;
        Ok(read_nul_terminated(&data))
    }

    /// Restart the console. The connection is gone afterwards.
    pub async fn reboot(&mut self) -> Result<()> {
        let mut ex = self.exchange(Command::ConsoleReboot)?;
        ex.send_packet(&[]).await?;
        drop(ex);

        let (_transport, channel) = self.state.take();
        if let Some(channel) = channel {
            channel.stop().await;
        }
        log::info!("Console rebooting, session closed");
        Ok(())
    }

    /// Print `text` on the console's serial output.
    pub async fn print(&mut self, text: &str) -> Result<()> {
        let data = terminated(text);
        let mut w = PayloadWriter::with_capacity(4);
        w.write_i32(wire_len(data.len())?);

        let mut ex = self.exchange(Command::ConsolePrint)?;
        ex.send_packet(&w.into_vec()).await?;
        ex.send_data(&data).await?;
        ex.check_status().await
    }

    /// Show a system notification of `message_type` on the console.
    pub async fn notify(&mut self, message_type: i32, text: &str) -> Result<()> {
        let data = terminated(text);
        let mut w = PayloadWriter::with_capacity(8);
        w.write_i32(message_type);
        w.write_i32(wire_len(data.len())?);

        let mut ex = self.exchange(Command::ConsoleNotify)?;
        ex.send_packet(&w.into_vec()).await?;
        ex.send_data(&data).await?;
        ex.check_status().await
    }

    /// Only the status is checked; the stub returns no information yet.
    pub async fn get_console_information(&mut self) -> Result<()> {
        self.call(Command::ConsoleInfo, &[]).await
    }

    /// End the session. The stub closes its side without a reply.
    pub async fn disconnect(&mut self) -> Result<()> {
        let mut ex = self.exchange(Command::ConsoleEnd)?;
        let sent = ex.send_packet(&[]).await;
        drop(ex);

        let (transport, channel) = self.state.take();
        if let Some(mut transport) = transport {
            if let Err(e) = transport.disconnect().await {
                log::warn!("Shutdown of the command connection failed: {}", e);
            }
        }
        if let Some(channel) = channel {
            channel.stop().await;
        }
        log::info!("Disconnected from console");
        sent
    }
}
