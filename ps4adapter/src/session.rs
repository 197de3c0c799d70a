/// Command exchanges
///
/// One command runs as one [`Exchange`]: header and payload out, status word
/// back, then whatever response or follow-up data the command defines. Each
/// step marks the exchange in flight while it awaits. A transport failure, or
/// the exchange being dropped mid-step, leaves the connection at an unknown
/// offset in the byte stream, so the session is torn down.

use crate::transport::{self, Transport};
use crate::wire::{decode_fixed, encode_header, FixedLayout, MAX_COMMAND_PAYLOAD};
use crate::{guard, Command, CommandStatus, DebugError, Ps4Debugger, Result, SessionState};
use crate::{TransportError, UsageError};

pub(crate) struct Exchange<'a> {
    state: &'a mut SessionState,
    command: Command,
    in_flight: bool,
}

impl<'a> Exchange<'a> {
    pub(crate) fn begin(state: &'a mut SessionState, command: Command) -> Result<Self> {
        guard(state.phase(), command)?;
        Ok(Self {
            state,
            command,
            in_flight: false,
        })
    }

    fn transport(&mut self) -> Result<&mut Transport> {
        self.state
            .transport()
            .ok_or(DebugError::Usage(UsageError::NotConnected))
    }

    fn settle<T>(&mut self, res: transport::Result<T>) -> Result<T> {
        self.in_flight = false;
        match res {
            Ok(value) => Ok(value),
            Err(e) => {
                log::error!("{} failed on the wire: {}", self.command, e);
                self.tear_down();
                Err(e.into())
            }
        }
    }

    fn tear_down(&mut self) {
        // Dropping the channel cancels it; its task exits on its own.
        let (_transport, channel) = self.state.take();
        if channel.is_some() {
            log::warn!("Session lost while debugging; interrupt channel cancelled");
        }
    }

    /// Send the command header followed by `payload`.
    pub(crate) async fn send_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_COMMAND_PAYLOAD {
            return Err(UsageError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_COMMAND_PAYLOAD,
            }
            .into());
        }
        let header = encode_header(self.command, payload.len() as u32);
        log::debug!("SEND[{}]: {} payload bytes", self.command, payload.len());

        self.in_flight = true;
        let transport = self.transport()?;
        let mut res = transport.send_exact(&header).await;
        if res.is_ok() && !payload.is_empty() {
            res = transport.send_exact(payload).await;
        }
        self.settle(res)
    }

    /// Read the status word; anything but success ends the exchange.
    pub(crate) async fn check_status(&mut self) -> Result<()> {
        self.in_flight = true;
        let res = self.transport()?.recv_u32().await;
        let status = CommandStatus::from_u32(self.settle(res)?);
        log::debug!("RECV[{}]: {}", self.command, status);
        if status.is_success() {
            Ok(())
        } else {
            Err(DebugError::Protocol {
                command: self.command,
                status,
            })
        }
    }

    /// Follow-up data for a multi-phase command. Not bound by the payload limit.
    pub(crate) async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("SEND[{}]: {} data bytes", self.command, data.len());
        self.in_flight = true;
        let res = self.transport()?.send_exact(data).await;
        self.settle(res)
    }

    pub(crate) async fn recv_data(&mut self, len: usize) -> Result<Vec<u8>> {
        self.in_flight = true;
        let res = self.transport()?.recv_exact(len).await;
        let data = self.settle(res)?;
        log::trace!("RECV[{}]: {} bytes", self.command, data.len());
        Ok(data)
    }

    /// Like `recv_data` with no receive timeout.
    pub(crate) async fn recv_data_unbounded(&mut self, len: usize) -> Result<Vec<u8>> {
        self.in_flight = true;
        let res = self.transport()?.recv_exact_unbounded(len).await;
        self.settle(res)
    }

    pub(crate) async fn recv_fixed<T: FixedLayout>(&mut self) -> Result<T> {
        let bytes = self.recv_data(T::SIZE).await?;
        Ok(decode_fixed(&bytes))
    }

    /// `count` back-to-back records of `T`.
    pub(crate) async fn recv_records<T: FixedLayout>(&mut self, count: usize) -> Result<Vec<T>> {
        let bytes = self.recv_data(count.saturating_mul(T::SIZE)).await?;
        Ok(bytes.chunks_exact(T::SIZE).map(decode_fixed).collect())
    }

    pub(crate) async fn recv_i32(&mut self) -> Result<i32> {
        self.in_flight = true;
        let res = self.transport()?.recv_i32().await;
        self.settle(res)
    }

    /// Element count preceding a list response.
    ///
    /// A negative count leaves the rest of the response undefined, so the
    /// session is torn down.
    pub(crate) async fn recv_count(&mut self) -> Result<usize> {
        let count = self.recv_i32().await?;
        usize::try_from(count).map_err(|_| {
            log::error!("{} reported count {}", self.command, count);
            self.tear_down();
            DebugError::BadCount {
                command: self.command,
                count,
            }
        })
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if self.in_flight {
            log::warn!(
                "{}: {}; closing the connection",
                self.command,
                TransportError::Desynchronized
            );
            self.tear_down();
        }
    }
}

/// Checks a caller-supplied length against a 32-bit length field.
pub(crate) fn wire_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| UsageError::LengthOutOfRange(len).into())
}

impl Ps4Debugger {
    pub(crate) fn exchange(&mut self, command: Command) -> Result<Exchange<'_>> {
        Exchange::begin(&mut self.state, command)
    }

    /// Run a command whose only response is its status word.
    pub async fn call(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        let mut ex = self.exchange(command)?;
        ex.send_packet(payload).await?;
        ex.check_status().await
    }

    /// Run a command that answers with one fixed-layout record.
    pub async fn call_returning<T: FixedLayout>(
        &mut self,
        command: Command,
        payload: &[u8],
    ) -> Result<T> {
        let mut ex = self.exchange(command)?;
        ex.send_packet(payload).await?;
        ex.check_status().await?;
        ex.recv_fixed().await
    }

    /// Run a command that answers with exactly `len` bytes.
    pub async fn call_returning_sized(
        &mut self,
        command: Command,
        payload: &[u8],
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut ex = self.exchange(command)?;
        ex.send_packet(payload).await?;
        ex.check_status().await?;
        ex.recv_data(len).await
    }

    /// Header, status, `data`, status: the shape of every upload.
    pub(crate) async fn call_uploading(
        &mut self,
        command: Command,
        payload: &[u8],
        data: &[u8],
    ) -> Result<()> {
        let mut ex = self.exchange(command)?;
        ex.send_packet(payload).await?;
        ex.check_status().await?;
        ex.send_data(data).await?;
        ex.check_status().await
    }
}
