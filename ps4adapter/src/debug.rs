/// Debugger commands
///
/// Attaching starts the interrupt channel before the stub is asked to
/// attach, since the stub connects back as soon as it processes the
/// command. Detaching tells the stub first and only then stops the channel.

use crate::interrupt::InterruptChannel;
use crate::wire::{encode_fixed, PayloadWriter, MAX_BREAKPOINTS, MAX_WATCHPOINTS};
use crate::{
    guard, Command, DebugRegisters, FloatingPointRegisters, GeneralRegisters, InterruptHandler,
    Ps4Debugger, Result, SessionPhase, SessionState, StopGo, ThreadInfo, UsageError,
    WatchpointBreakType, WatchpointLength,
};

fn lwpid_payload(lwpid: u32) -> Vec<u8> {
    lwpid.to_le_bytes().to_vec()
}

impl Ps4Debugger {
    /// Attach to `pid`; every stop of a debugged thread is reported to `handler`.
    pub async fn attach_debugger<H>(&mut self, pid: i32, handler: H) -> Result<()>
    where
        H: InterruptHandler + 'static,
    {
        match self.phase() {
            SessionPhase::Disconnected => return Err(UsageError::NotConnected.into()),
            SessionPhase::Debugging => return Err(UsageError::AlreadyDebugging.into()),
            SessionPhase::Connected => {}
        }

        let channel = InterruptChannel::listen(
            self.config().interrupt_bind,
            self.config().poll_interval,
            handler,
        )
        .await?;

        if let Err(e) = self.call(Command::DebugAttach, &pid.to_le_bytes()).await {
            log::warn!("Attach to pid {} rejected: {}", pid, e);
            channel.stop().await;
            return Err(e);
        }

        match std::mem::replace(&mut self.state, SessionState::Disconnected) {
            SessionState::Connected(transport) => {
                self.state = SessionState::Debugging(transport, channel);
                log::info!("Attached to pid {}", pid);
                Ok(())
            }
            other => {
                self.state = other;
                channel.stop().await;
                Err(UsageError::NotConnected.into())
            }
        }
    }

    /// Detach from the debugged process and shut the interrupt channel down.
    pub async fn detach_debugger(&mut self) -> Result<()> {
        self.call(Command::DebugDetach, &[]).await?;

        let channel = match std::mem::replace(&mut self.state, SessionState::Disconnected) {
            SessionState::Debugging(transport, channel) => {
                self.state = SessionState::Connected(transport);
                Some(channel)
            }
            other => {
                self.state = other;
                None
            }
        };
        if let Some(channel) = channel {
            channel.stop().await;
        }
        log::info!("Detached");
        Ok(())
    }

    async fn stop_go(&mut self, op: StopGo) -> Result<()> {
        self.call(Command::DebugStopGo, &(op as i32).to_le_bytes())
            .await
    }

    /// Suspend the debugged process.
    pub async fn process_stop(&mut self) -> Result<()> {
        self.stop_go(StopGo::Stop).await
    }

    /// Kill the debugged process.
    pub async fn process_kill(&mut self) -> Result<()> {
        self.stop_go(StopGo::Kill).await
    }

    /// Resume the debugged process.
    pub async fn process_resume(&mut self) -> Result<()> {
        self.stop_go(StopGo::Resume).await
    }

    /// Set or clear hardware breakpoint `index` (0..10).
    pub async fn change_breakpoint(&mut self, index: u32, enabled: bool, address: u64) -> Result<()> {
        guard(self.phase(), Command::DebugBreakpoint)?;
        if index >= MAX_BREAKPOINTS {
            return Err(UsageError::BreakpointIndexOutOfRange {
                index,
                capacity: MAX_BREAKPOINTS,
            }
            .into());
        }

        let mut w = PayloadWriter::with_capacity(16);
        w.write_u32(index);
        w.write_i32(enabled as i32);
        w.write_u64(address);
        self.call(Command::DebugBreakpoint, &w.into_vec()).await
    }

    /// Set or clear watchpoint `index` (0..4).
    pub async fn change_watchpoint(
        &mut self,
        index: u32,
        enabled: bool,
        length: WatchpointLength,
        break_type: WatchpointBreakType,
        address: u64,
    ) -> Result<()> {
        guard(self.phase(), Command::DebugWatchpoint)?;
        if index >= MAX_WATCHPOINTS {
            return Err(UsageError::WatchpointIndexOutOfRange {
                index,
                capacity: MAX_WATCHPOINTS,
            }
            .into());
        }

        let mut w = PayloadWriter::with_capacity(24);
        w.write_u32(index);
        w.write_i32(enabled as i32);
        w.write_u32(length as u32);
        w.write_u32(break_type as u32);
        w.write_u64(address);
        self.call(Command::DebugWatchpoint, &w.into_vec()).await
    }

    /// Thread ids (lwpids) of the debugged process.
    pub async fn get_thread_list(&mut self) -> Result<Vec<u32>> {
        let mut ex = self.exchange(Command::DebugThreads)?;
        ex.send_packet(&[]).await?;
        ex.check_status().await?;
        let count = ex.recv_count().await?;
        ex.recv_records(count).await
    }

    pub async fn get_thread_info(&mut self, lwpid: u32) -> Result<ThreadInfo> {
        self.call_returning(Command::DebugThreadInfo, &lwpid_payload(lwpid))
            .await
    }

    /// Suspend one thread.
    pub async fn stop_thread(&mut self, lwpid: u32) -> Result<()> {
        self.call(Command::DebugStopThread, &lwpid_payload(lwpid))
            .await
    }

    /// Resume one thread.
    pub async fn resume_thread(&mut self, lwpid: u32) -> Result<()> {
        self.call(Command::DebugResumeThread, &lwpid_payload(lwpid))
            .await
    }

    /// General-purpose registers of a stopped thread.
    pub async fn get_registers(&mut self, lwpid: u32) -> Result<GeneralRegisters> {
        self.call_returning(Command::DebugGetRegs, &lwpid_payload(lwpid))
            .await
    }

    /// Overwrite the general-purpose registers of a stopped thread.
    pub async fn set_registers(&mut self, lwpid: u32, regs: &GeneralRegisters) -> Result<()> {
        self.upload_registers(Command::DebugSetRegs, lwpid, &encode_fixed(regs))
            .await
    }

    /// FPU and SSE state of a stopped thread.
    pub async fn get_float_registers(&mut self, lwpid: u32) -> Result<FloatingPointRegisters> {
        self.call_returning(Command::DebugGetFpRegs, &lwpid_payload(lwpid))
            .await
    }

    /// Overwrite the FPU and SSE state of a stopped thread.
    pub async fn set_float_registers(
        &mut self,
        lwpid: u32,
        fpregs: &FloatingPointRegisters,
    ) -> Result<()> {
        self.upload_registers(Command::DebugSetFpRegs, lwpid, &encode_fixed(fpregs))
            .await
    }

    /// Hardware debug registers dr0..dr15 of a thread.
    pub async fn get_debug_registers(&mut self, lwpid: u32) -> Result<DebugRegisters> {
        self.call_returning(Command::DebugGetDbRegs, &lwpid_payload(lwpid))
            .await
    }

    pub async fn set_debug_registers(&mut self, lwpid: u32, dbregs: &DebugRegisters) -> Result<()> {
        self.upload_registers(Command::DebugSetDbRegs, lwpid, &encode_fixed(dbregs))
            .await
    }

    async fn upload_registers(&mut self, command: Command, lwpid: u32, block: &[u8]) -> Result<()> {
        let mut w = PayloadWriter::with_capacity(8);
        w.write_u32(lwpid);
        w.write_i32(block.len() as i32);
        self.call_uploading(command, &w.into_vec(), block).await
    }

    /// Execute one instruction in the stopped process.
    pub async fn single_step(&mut self) -> Result<()> {
        self.call(Command::DebugSingleStep, &[]).await
    }
}
