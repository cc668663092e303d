//! The session with one target: connection, lifecycle and the event pump.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::calling_convention::{Aapcs, TargetAccess};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::halt_point::HaltPointRegistry;
use crate::intercept::InterceptRegistry;
use crate::memory::{
    MemoryModel, MemoryState, ScratchArena, Trampoline, SCRATCH_ALIGNMENT, STACK_CANARY,
    THUMB_NOPS,
};
use crate::mi::record::{Tuple, Value as MiValue};
use crate::mi::{AsyncKind, Command, Deadline, Delivery, Event, ListenerId, Polled, Transport};
use crate::registers::{CoreRegister, Registers};
use crate::symbols::SymbolCatalog;

/// Steps taken at most to leave an IT block after a halt.
const MAX_IT_STEPS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Right after connecting or loading an image.
    Unknown,
    Halted { stop_pc: u32 },
    Running,
    Exited,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TargetState::Unknown => write!(f, "in an unknown state"),
            TargetState::Halted { stop_pc } => write!(f, "halted at {:#010x}", stop_pc),
            TargetState::Running => write!(f, "running"),
            TargetState::Exited => write!(f, "exited"),
        }
    }
}

/// All state of one debugging session, passed explicitly to every operation.
pub struct TargetSession {
    pub(crate) transport: Transport,
    pub(crate) config: SessionConfig,
    pub(crate) state: TargetState,
    pub(crate) catalog: SymbolCatalog,
    pub(crate) registers: Registers,
    pub(crate) memory: MemoryState,
    pub(crate) intercepts: InterceptRegistry,
    pub(crate) halt_points: HaltPointRegistry,
    pub(crate) convention: Aapcs,
    /// Nested operations in progress, i.e. calls and intercept callbacks.
    pub(crate) depth: usize,
    /// Failed intercept callbacks, reported by the operation that waited on the target.
    pub(crate) callback_errors: Vec<Error>,
    /// Stops the debugger would not report, see `resume`.
    pub(crate) synthetic: VecDeque<Delivery>,
    state_listener: ListenerId,
}

impl TargetSession {
    /// Starts the debugger and attaches to the target.
    pub fn connect(config: SessionConfig) -> Result<TargetSession> {
        config.memory_model.validate()?;
        let transport = Transport::spawn(&config.gdb, &config.gdb_args)?;
        TargetSession::with_transport(transport, config)
    }

    /// Attaches to the target through an already running debugger.
    pub fn with_transport(mut transport: Transport, config: SessionConfig) -> Result<TargetSession> {
        let state_listener = transport.subscribe(|event| event.kind == AsyncKind::Exec);
        let mut session = TargetSession {
            transport,
            config,
            state: TargetState::Unknown,
            catalog: SymbolCatalog::default(),
            registers: Registers::default(),
            memory: MemoryState::default(),
            intercepts: InterceptRegistry::default(),
            halt_points: HaltPointRegistry::default(),
            convention: Aapcs,
            depth: 0,
            callback_errors: vec![],
            synthetic: VecDeque::new(),
            state_listener,
        };

        session.execute(Command::SetAsync(true))?;
        let remote = session.config.remote.clone();
        let mode = session.config.remote_mode.clone();
        session.execute(Command::Connect {
            mode,
            remote: remote.clone(),
        })?;
        session.execute(Command::Console(
            "set mem inaccessible-by-default off".to_string(),
        ))?;
        info!("Connected to {}", remote);

        if let Some(symbols) = session.config.symbols_file().map(|p| p.to_path_buf()) {
            session.execute(Command::LoadExecutable(symbols.display().to_string()))?;
            session.attach_debug_info(&symbols);
        }
        Ok(session)
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn memory_model(&self) -> &MemoryModel {
        &self.config.memory_model
    }

    pub fn catalog(&self) -> &SymbolCatalog {
        &self.catalog
    }

    /// The scratch memory of the prepared memory model.
    pub fn scratch(&self) -> Option<&ScratchArena> {
        self.memory.arena.as_ref()
    }

    /// The address calls return to.
    pub fn trampoline(&self) -> Option<u32> {
        self.memory.trampoline.map(|t| t.address)
    }

    /// Downloads a new image. Intercepts, halt points and cached symbols are dropped.
    pub fn load_image(&mut self, path: &Path) -> Result<()> {
        if self.state == TargetState::Running {
            self.halt()?;
        }
        self.delete_all_intercepts()?;
        self.delete_all_halt_points()?;
        self.remove_trampoline();
        self.synthetic.clear();

        self.execute(Command::LoadExecutable(path.display().to_string()))?;
        let timeout = self.config.run_timeout();
        self.transport
            .execute(&Command::Download, timeout)?;
        self.catalog.invalidate();
        self.registers.clear();
        let symbols = self
            .config
            .symbols
            .clone()
            .unwrap_or_else(|| path.to_path_buf());
        self.attach_debug_info(&symbols);

        self.set_state(TargetState::Unknown);
        info!("Loaded {}", path.display());
        Ok(())
    }

    /// Resets the target, which is left halted with its memory model prepared.
    pub fn reset(&mut self) -> Result<()> {
        let reset = self.config.reset_command.clone();
        self.execute(Command::Console(reset))?;
        self.execute(Command::Console("flushregs".to_string()))?;
        self.registers.clear();
        self.synthetic.clear();
        let pc = self.read_core_register(CoreRegister::Pc)?;
        self.set_state(TargetState::Halted { stop_pc: pc });
        self.prepare_memory_model()
    }

    /// Lets the target run freely.
    ///
    /// A breakpoint of the engine at the program counter is stepped over, the target is halted
    /// there already.
    pub fn run(&mut self) -> Result<()> {
        self.require_halted()?;
        self.synthetic.clear();
        let pc = self.read_core_register(CoreRegister::Pc)?;
        if let Some(breakpoint) = self.engine_breakpoint_number(pc) {
            debug!("Stepping over breakpoint {} at {:#010x}", breakpoint, pc);
            self.step_over(breakpoint)?;
        }
        self.continue_target()
    }

    /// Stops a running target.
    ///
    /// An interrupted IT block is left by single stepping, so the target can be called into.
    pub fn halt(&mut self) -> Result<u32> {
        if let TargetState::Halted { stop_pc } = self.state {
            if !self.synthetic.is_empty() {
                debug!("Dropping {} queued stops", self.synthetic.len());
                self.synthetic.clear();
            }
            return Ok(stop_pc);
        }
        match self.execute(Command::Interrupt) {
            Ok(_) => {
                let deadline = Deadline::after(self.config.command_timeout());
                self.wait_stop(&deadline)?;
            }
            Err(Error::CommandFailed { message, .. }) if self.state == TargetState::Unknown => {
                debug!("Interrupt refused ({}), reading the stop address", message);
                let pc = self.read_core_register(CoreRegister::Pc)?;
                self.set_state(TargetState::Halted { stop_pc: pc });
            }
            Err(err) => return Err(err),
        }

        for _ in 0..MAX_IT_STEPS {
            let xpsr = self.read_core_register(CoreRegister::Xpsr)?;
            if !in_it_block(xpsr) {
                break;
            }
            debug!("Halted inside an IT block (xPSR {:#010x}), stepping", xpsr);
            self.step_raw()?;
        }
        self.require_halted()
    }

    /// Executes one instruction, returns the new program counter.
    pub fn step_instruction(&mut self) -> Result<u32> {
        self.require_halted()?;
        self.step_raw()?;
        self.require_halted()
    }

    /// Waits for a running target to stop, servicing intercepts meanwhile.
    pub fn wait_for_stop(&mut self, timeout: Duration) -> Result<TargetState> {
        let errors = self.callback_errors.len();
        let deadline = Deadline::after(timeout);
        self.wait_stop(&deadline)?;
        self.take_callback_error(errors)?;
        Ok(self.state)
    }

    /// Services intercept hits of a free running target until `timeout` passes or it stops.
    ///
    /// Returns the number of intercept hits handled.
    pub fn process_events(&mut self, timeout: Duration) -> Result<usize> {
        let errors = self.callback_errors.len();
        let deadline = Deadline::after(timeout);
        let mut handled = 0;
        loop {
            let delivery = match self.next_delivery(&deadline) {
                Ok(delivery) => delivery,
                Err(Error::Timeout(_)) => break,
                Err(err) => return Err(err),
            };
            if self.observe(&delivery)? {
                continue;
            }
            if let Some(id) = self.intercepts.by_listeners(&delivery.listeners) {
                self.dispatch_intercept(id, &delivery.event)?;
                handled += 1;
            } else if delivery.event.is_stopped() {
                break;
            }
        }
        self.take_callback_error(errors)?;
        Ok(handled)
    }

    /// Removes all intercepts and halt points and ends the debugger.
    pub fn disconnect(mut self) -> Result<()> {
        if self.state == TargetState::Running {
            if let Err(err) = self.halt() {
                warn!("Could not halt the target before disconnecting: {}", err);
            }
        }
        if let Err(err) = self.delete_all_intercepts() {
            warn!("Could not remove all intercepts: {}", err);
        }
        if let Err(err) = self.delete_all_halt_points() {
            warn!("Could not remove all halt points: {}", err);
        }
        self.remove_trampoline();
        self.transport.unsubscribe(self.state_listener);
        let timeout = self.config.command_timeout();
        self.transport.shutdown(timeout)?;
        info!("Disconnected");
        Ok(())
    }

    pub(crate) fn execute(&mut self, command: Command) -> Result<crate::mi::ResultRecord> {
        let timeout = self.config.command_timeout();
        self.transport.execute(&command, timeout)
    }

    pub(crate) fn require_halted(&self) -> Result<u32> {
        match self.state {
            TargetState::Halted { stop_pc } => Ok(stop_pc),
            state => Err(Error::TargetState(state)),
        }
    }

    /// Marks the start of a nested operation.
    pub(crate) fn enter(&mut self) -> Result<()> {
        if self.depth >= self.config.max_nesting {
            return Err(Error::NestingTooDeep(self.config.max_nesting));
        }
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Returns the first callback failure recorded since `errors` failures were known.
    pub(crate) fn take_callback_error(&mut self, errors: usize) -> Result<()> {
        if self.callback_errors.len() > errors {
            let mut failed: Vec<Error> = self.callback_errors.drain(errors..).collect();
            for err in failed.iter().skip(1) {
                warn!("Further intercept failure: {}", err);
            }
            return Err(failed.remove(0));
        }
        Ok(())
    }

    fn set_state(&mut self, state: TargetState) {
        if self.state != state {
            match state {
                TargetState::Running => debug!("Target {}", state),
                _ => info!("Target {}", state),
            }
        }
        self.state = state;
    }

    fn track_state(&mut self, event: &Event) {
        if event.is_running() {
            self.set_state(TargetState::Running);
        } else if event.is_stopped() {
            if event.reason().map_or(false, |r| r.starts_with("exited")) {
                self.set_state(TargetState::Exited);
            } else {
                let stop_pc = event.frame_address().unwrap_or(0);
                self.set_state(TargetState::Halted { stop_pc });
            }
        }
    }

    /// Lets the halted target continue from its program counter.
    ///
    /// The debugger steps over a breakpoint at the address it last stopped at without reporting
    /// it. If the engine owns a breakpoint there, the stop it would have caused is queued instead
    /// and the target is not resumed.
    pub(crate) fn resume(&mut self) -> Result<()> {
        let pc = self.read_core_register(CoreRegister::Pc)?;
        if let TargetState::Halted { stop_pc } = self.state {
            if pc == stop_pc {
                if let Some(delivery) = self.engine_breakpoint_at(pc) {
                    debug!("Resuming on an engine breakpoint at {:#010x}", pc);
                    self.synthetic.push_back(delivery);
                    return Ok(());
                }
            }
        }
        self.continue_target()
    }

    pub(crate) fn continue_target(&mut self) -> Result<()> {
        self.execute(Command::Continue)?;
        self.registers.clear();
        self.set_state(TargetState::Running);
        Ok(())
    }

    /// Any breakpoint the engine inserted at `pc`.
    fn engine_breakpoint_number(&self, pc: u32) -> Option<u32> {
        self.intercepts
            .breakpoint_at(pc)
            .map(|(number, _)| number)
            .or_else(|| self.halt_points.breakpoint_at(pc))
            .or_else(|| {
                self.memory
                    .trampoline
                    .filter(|trampoline| trampoline.address == pc)
                    .map(|trampoline| trampoline.breakpoint)
            })
    }

    fn engine_breakpoint_at(&self, pc: u32) -> Option<Delivery> {
        if let Some((number, listener)) = self.intercepts.breakpoint_at(pc) {
            return Some(Delivery {
                event: breakpoint_hit(number, pc),
                listeners: vec![listener],
            });
        }
        match self.memory.trampoline {
            Some(trampoline) if trampoline.address == pc => Some(Delivery {
                event: breakpoint_hit(trampoline.breakpoint, pc),
                listeners: vec![],
            }),
            _ => None,
        }
    }

    pub(crate) fn next_delivery(&mut self, deadline: &Deadline) -> Result<Delivery> {
        if let Some(delivery) = self.synthetic.pop_front() {
            return Ok(delivery);
        }
        loop {
            match self.transport.poll(None, deadline)? {
                Polled::Event(delivery) => {
                    trace!("Event {}", delivery.event.describe());
                    return Ok(delivery);
                }
                Polled::Result(record) => {
                    warn!("Unexpected result for `{}`", record.command);
                }
            }
        }
    }

    /// Tracks the target state and counts halt point hits.
    ///
    /// Returns true if the stop was at a barrier, which resumed the target.
    pub(crate) fn observe(&mut self, delivery: &Delivery) -> Result<bool> {
        self.track_state(&delivery.event);
        if !delivery.event.is_stopped() {
            return Ok(false);
        }
        match self.halt_points.record_hit(&delivery.listeners) {
            Some(true) => {
                self.continue_target()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Waits for the target to stop, running the callbacks of intercepts hit on the way.
    pub(crate) fn wait_stop(&mut self, deadline: &Deadline) -> Result<Event> {
        loop {
            let delivery = self.next_delivery(deadline)?;
            if self.observe(&delivery)? {
                continue;
            }
            if let Some(id) = self.intercepts.by_listeners(&delivery.listeners) {
                self.dispatch_intercept(id, &delivery.event)?;
                continue;
            }
            if delivery.event.is_stopped() {
                return Ok(delivery.event);
            }
        }
    }

    /// Waits for the next stop, whatever caused it.
    fn wait_stop_raw(&mut self, deadline: &Deadline) -> Result<Event> {
        loop {
            let delivery = self.next_delivery(deadline)?;
            self.track_state(&delivery.event);
            if delivery.event.is_stopped() {
                return Ok(delivery.event);
            }
        }
    }

    pub(crate) fn step_raw(&mut self) -> Result<Event> {
        self.execute(Command::StepInstruction)?;
        self.registers.clear();
        self.set_state(TargetState::Running);
        let deadline = Deadline::after(self.config.command_timeout());
        self.wait_stop_raw(&deadline)
    }

    /// Executes past the breakpoint at the program counter.
    pub(crate) fn step_over(&mut self, breakpoint: u32) -> Result<()> {
        self.execute(Command::DisableBreakpoint(breakpoint))?;
        let stepped = self.step_raw();
        self.execute(Command::EnableBreakpoint(breakpoint))?;
        stepped.map(|_| ())
    }

    pub(crate) fn insert_breakpoint(
        &mut self,
        address: u32,
        hardware: bool,
        temporary: bool,
    ) -> Result<u32> {
        let record = self.execute(Command::InsertBreakpoint {
            address,
            hardware,
            temporary,
        })?;
        let number = record
            .results
            .get_tuple("bkpt")
            .and_then(|bkpt| bkpt.get_u64("number"))
            .ok_or_else(|| {
                Error::Protocol(format!("breakpoint reply without number: {}", record.results))
            })?;
        trace!("Breakpoint {} at {:#010x}", number, address);
        Ok(number as u32)
    }

    /// Runs until `location` is reached.
    fn run_to(&mut self, location: &str) -> Result<u32> {
        let address = self.resolve(location)?.address & !1;
        if self.require_halted()? == address {
            return Ok(address);
        }
        let breakpoint = self.insert_breakpoint(address, false, false)?;
        let reached = self.resume().and_then(|_| {
            let deadline = Deadline::after(self.config.run_timeout());
            self.wait_stop(&deadline)
        });
        self.execute(Command::DeleteBreakpoint(breakpoint))?;
        let stop = reached?;
        match stop.frame_address() {
            Some(pc) if pc == address => {
                debug!("Reached `{}`", location);
                Ok(pc)
            }
            pc => Err(Error::UnexpectedStop {
                pc: pc.unwrap_or(0),
                reason: stop.describe(),
            }),
        }
    }

    fn prepare_memory_model(&mut self) -> Result<()> {
        self.remove_trampoline();
        self.memory = MemoryState::default();
        let model = self.config.memory_model.clone();
        debug!("Preparing the {} memory model", model.kind());

        match model {
            MemoryModel::None { trampoline } => {
                if let Some(trampoline) = trampoline {
                    self.set_trampoline(&trampoline, true)?;
                }
            }
            MemoryModel::Flash {
                trampoline,
                halt_location,
                scratch_size,
            } => {
                self.run_to(&halt_location)?;
                let sp = self.read_core_register(CoreRegister::Sp)?;
                let canary = scratch_size
                    .checked_add(4)
                    .and_then(|reserved| sp.checked_sub(reserved))
                    .map(|canary| canary & !7)
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "{} bytes of scratch memory do not fit below the stack pointer {:#010x}",
                            scratch_size, sp
                        ))
                    })?;
                self.write_memory(canary, &STACK_CANARY.to_le_bytes())?;
                let base = canary + 4;
                self.set_arena(ScratchArena::new(base, sp - base))?;
                self.write_core_register(CoreRegister::Sp, canary)?;
                self.memory.canary = Some(canary);
                self.set_trampoline(&trampoline, true)?;
            }
            MemoryModel::Sram {
                base,
                size,
                halt_location,
            } => {
                self.run_to(&halt_location)?;
                self.write_memory(base, &THUMB_NOPS)?;
                let start = base + THUMB_NOPS.len() as u32;
                self.set_arena(ScratchArena::new(start, size - THUMB_NOPS.len() as u32))?;
                let breakpoint = self.insert_breakpoint(base, false, false)?;
                self.memory.trampoline = Some(Trampoline {
                    address: base,
                    breakpoint,
                });
            }
            MemoryModel::TestHook { hook, trampoline } => {
                self.run_to(&hook)?;
                let base = self.read_core_register(CoreRegister::R(0))?;
                let size = self.read_core_register(CoreRegister::R(1))?;
                self.set_arena(ScratchArena::new(base, size))?;
                self.set_trampoline(&trampoline, true)?;
            }
        }
        if let Some(arena) = &self.memory.arena {
            info!(
                "Scratch memory at {:#010x}, {} bytes",
                arena.base(),
                arena.size()
            );
        }
        Ok(())
    }

    fn set_arena(&mut self, arena: ScratchArena) -> Result<()> {
        let mut address = arena.base();
        let end = arena.base() + arena.size();
        let zeros = [0u8; 1024];
        while address < end {
            let chunk = (end - address).min(zeros.len() as u32);
            self.write_memory(address, &zeros[..chunk as usize])?;
            address += chunk;
        }
        self.memory.arena = Some(arena);
        Ok(())
    }

    fn set_trampoline(&mut self, location: &str, hardware: bool) -> Result<()> {
        let address = self.resolve(location)?.address & !1;
        let breakpoint = self.insert_breakpoint(address, hardware, false)?;
        self.memory.trampoline = Some(Trampoline {
            address,
            breakpoint,
        });
        Ok(())
    }

    fn remove_trampoline(&mut self) {
        if let Some(trampoline) = self.memory.trampoline.take() {
            if let Err(err) = self.execute(Command::DeleteBreakpoint(trampoline.breakpoint)) {
                warn!("Could not remove the trampoline breakpoint: {}", err);
            }
        }
    }

    /// Warns if a call ran into the scratch memory of the flash model.
    pub(crate) fn check_canary(&mut self) {
        if let Some(address) = self.memory.canary {
            match self.read_memory(address, 4) {
                Ok(bytes) if bytes == STACK_CANARY.to_le_bytes() => (),
                Ok(bytes) => warn!(
                    "Stack canary at {:#010x} overwritten: {:02x?}, scratch memory is corrupt",
                    address, bytes
                ),
                Err(err) => warn!("Could not check the stack canary: {}", err),
            }
        }
    }

    fn attach_debug_info(&mut self, path: &Path) {
        if !path.exists() {
            debug!("{} not found on the host, types come from the debugger", path.display());
            return;
        }
        if let Err(err) = self.catalog.attach_debug_info(path) {
            warn!("{}, types come from the debugger", err);
        }
    }

    /// Aligns scratch allocations.
    pub(crate) fn scratch_alignment(alignment: u32) -> u32 {
        alignment.max(SCRATCH_ALIGNMENT)
    }
}

/// True while the xPSR reports an open IT block.
fn in_it_block(xpsr: u32) -> bool {
    ((xpsr >> 25) & 0x3) != 0 || ((xpsr >> 10) & 0x3f) != 0
}

fn breakpoint_hit(number: u32, address: u32) -> Event {
    Event {
        kind: AsyncKind::Exec,
        class: "stopped".to_string(),
        results: Tuple(vec![
            ("reason".to_string(), MiValue::Const("breakpoint-hit".to_string())),
            ("bkptno".to_string(), MiValue::Const(number.to_string())),
            (
                "frame".to_string(),
                MiValue::Tuple(Tuple(vec![(
                    "addr".to_string(),
                    MiValue::Const(format!("{:#010x}", address)),
                )])),
            ),
        ]),
    }
}
