//! A debugging session: one process, a selected thread and the command
//! loop that drives them.

use std::io::{self, BufRead, Write};

use stepwise_core::breakpoints::{BreakpointBuilder, BreakpointHandle};
use stepwise_core::events::{TargetEvent, TargetEventReceiver};
use stepwise_core::process::Completion;
use stepwise_core::types::{Address, TargetState, X86_64Register};
use stepwise_core::{Process, Result, StepwiseError, Thread};
use tracing::{debug, info, warn};

use crate::commands::{self, Command, Location};

/// Bytes per line of a memory dump.
const DUMP_WIDTH: usize = 16;
/// Backtrace depth when `bt` has no argument.
const DEFAULT_FRAMES: usize = 32;

pub struct Session
{
    process: Process,
    current: Thread,
    events: TargetEventReceiver,
    attached: bool,
}

impl Session
{
    /// Start a session on the process's main thread.
    ///
    /// ## Errors
    ///
    /// `NoTarget` if the process has no threads.
    pub fn new(process: Process, attached: bool) -> Result<Self>
    {
        let current = process.main_thread()?;
        let events = process.subscribe()?;
        Ok(Self {
            process,
            current,
            events,
            attached,
        })
    }

    /// Read commands from `input` until `quit` or end of input.
    ///
    /// ## Errors
    ///
    /// Only I/O errors on the terminal end the loop; command failures are
    /// printed and the loop continues.
    pub fn run(mut self, input: impl BufRead) -> io::Result<()>
    {
        let mut lines = input.lines();
        loop {
            print!("(stepwise) ");
            io::stdout().flush()?;

            let Some(line) = lines.next() else {
                println!();
                break;
            };
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            match commands::parse(&line) {
                Ok(command) => match self.execute(command) {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(e) => println!("error: {e}"),
                },
                Err(e) => println!("{e}"),
            }
            self.report_background_events();
        }
        self.finish_session();
        Ok(())
    }

    /// Run one command. `Ok(false)` ends the session.
    fn execute(&mut self, command: Command) -> Result<bool>
    {
        debug!(thread = %self.current.tid(), ?command, "command");
        match command {
            Command::StepLine => self.report(self.current.step_line()?)?,
            Command::NextLine => self.report(self.current.next_line()?)?,
            Command::StepInstruction => self.report(self.current.step_instruction()?)?,
            Command::StepNativeInstruction => self.report(self.current.step_native_instruction()?)?,
            Command::NextInstruction => self.report(self.current.next_instruction()?)?,
            Command::Finish => self.report(self.current.finish()?)?,
            Command::Continue => self.report(self.current.continue_execution()?)?,
            Command::Until(location) => {
                let address = self.resolve(&location)?;
                self.report(self.current.run_until(address)?)?;
            }
            Command::Background => {
                self.current.run_in_background()?;
                println!("Thread {} running in the background", self.current.tid());
            }
            Command::Interrupt => {
                if self.current.interrupt()? {
                    self.print_frame()?;
                } else {
                    println!("Thread {} is not running", self.current.tid());
                }
            }
            Command::Break {
                location,
                group,
                hit_count,
            } => {
                let address = self.resolve(&location)?;
                let mut builder = BreakpointBuilder::new(address);
                if let Some(group) = group {
                    builder = builder.group(group);
                }
                if let Some(count) = hit_count {
                    builder = builder.with_hit_count(count);
                }
                let handle = self.current.insert_breakpoint(builder)?;
                println!("Breakpoint {handle} at {address}");
            }
            Command::Delete(handle) => self.current.remove_breakpoint(BreakpointHandle(handle))?,
            Command::Enable(handle) => self.current.enable_breakpoint(BreakpointHandle(handle))?,
            Command::Disable(handle) => self.current.disable_breakpoint(BreakpointHandle(handle))?,
            Command::EnableGroup(group) => {
                let count = self.current.enable_group(&group)?;
                println!("Enabled {count} breakpoint(s) in '{group}'");
            }
            Command::DisableGroup(group) => {
                let count = self.current.disable_group(&group)?;
                println!("Disabled {count} breakpoint(s) in '{group}'");
            }
            Command::Backtrace(max) => {
                let backtrace = self.current.get_backtrace(max.unwrap_or(DEFAULT_FRAMES))?;
                print!("{backtrace}");
            }
            Command::Frame => self.print_frame()?,
            Command::Registers => self.print_registers()?,
            Command::SetRegister { name, value } => {
                let register = X86_64Register::from_name(&name)
                    .ok_or_else(|| StepwiseError::InvalidArgument(format!("unknown register '{name}'")))?;
                let mut registers = self.current.get_registers()?;
                registers.set_x86(register, value);
                self.current.set_registers(registers)?;
            }
            Command::Examine { address, len } => {
                let bytes = self.current.read_memory(address, len)?;
                print_dump(address, &bytes);
            }
            Command::Write { address, bytes } => self.current.write_memory(address, &bytes)?,
            Command::Maps => {
                for region in self.process.memory_maps()? {
                    println!(
                        "{:#014x}-{:#014x} {} {}",
                        region.start,
                        region.end,
                        region.permissions,
                        region.name.as_deref().unwrap_or("")
                    );
                }
            }
            Command::Threads => {
                for thread in self.process.threads() {
                    let marker = if thread.tid() == self.current.tid() { '*' } else { ' ' };
                    println!("{marker} {} {}", thread.tid(), thread.state());
                }
            }
            Command::SelectThread(tid) => {
                self.current = self
                    .process
                    .thread(tid)
                    .ok_or_else(|| StepwiseError::InvalidArgument(format!("no thread {tid}")))?;
                println!("Thread {tid} ({})", self.current.state());
            }
            Command::Kill => {
                self.process.kill()?;
                println!("Killed {}", self.process.pid());
                return Ok(false);
            }
            Command::Detach => {
                self.process.detach()?;
                println!("Detached from {}", self.process.pid());
                return Ok(false);
            }
            Command::Help => println!("{}", commands::HELP),
            Command::Quit => {
                self.finish_session();
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Wait for a stepping operation and print where it ended.
    fn report(&mut self, completion: Completion<TargetEvent>) -> Result<()>
    {
        let event = completion.wait()?;
        println!("{}", event.describe());
        if event.is_terminal() {
            self.select_live_thread();
        }
        Ok(())
    }

    fn resolve(&self, location: &Location) -> Result<Address>
    {
        match location {
            Location::Address(address) => Ok(*address),
            Location::Symbol(name) => self
                .process
                .symbols()
                .lookup_by_name(name)
                .map(|method| method.body_start())
                .ok_or_else(|| StepwiseError::InvalidArgument(format!("no function named '{name}'"))),
        }
    }

    fn print_frame(&self) -> Result<()>
    {
        let frame = self.current.current_frame()?;
        match &frame.source {
            Some(source) => println!("{frame}\n    {source}"),
            None => println!("{frame}"),
        }
        Ok(())
    }

    fn print_registers(&self) -> Result<()>
    {
        let registers = self.current.get_registers()?;
        for register in X86_64Register::ALL {
            if let Some(value) = registers.x86(register) {
                println!("{:<8} {value:#018x}", register.name());
            }
        }
        Ok(())
    }

    /// Print events that did not come from the command just run.
    fn report_background_events(&mut self)
    {
        let current = self.current.tid();
        let mut current_died = false;
        for event in self.events.try_iter() {
            match &event {
                TargetEvent::ThreadCreated { .. } => println!("[{}]", event.describe()),
                event if event.is_terminal() => {
                    if event.thread() == current {
                        current_died = true;
                    } else {
                        println!("[{}]", event.describe());
                    }
                }
                _ => {}
            }
        }
        if current_died {
            self.select_live_thread();
        }
    }

    /// Move the selection off a dead thread, if another one is alive.
    fn select_live_thread(&mut self)
    {
        if !self.current.state().is_dead() {
            return;
        }
        if let Some(thread) = self.process.threads().into_iter().find(|thread| !thread.state().is_dead()) {
            println!("[Switching to thread {}]", thread.tid());
            self.current = thread;
        }
    }

    /// Leave the target the way it was found: detach from attached
    /// processes, kill launched ones.
    fn finish_session(&self)
    {
        let alive = self
            .process
            .threads()
            .iter()
            .any(|thread| !thread.state().is_dead() && thread.state() != TargetState::CoreFile);
        if !alive {
            return;
        }
        let result = if self.attached {
            self.process.detach()
        } else {
            self.process.kill()
        };
        match result {
            Ok(()) => info!(pid = %self.process.pid(), attached = self.attached, "session ended"),
            Err(e) => warn!(pid = %self.process.pid(), error = %e, "cannot release target"),
        }
    }
}

fn print_dump(address: Address, bytes: &[u8])
{
    for (row, chunk) in bytes.chunks(DUMP_WIDTH).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&byte| if byte.is_ascii_graphic() { byte as char } else { '.' })
            .collect();
        println!(
            "{} {:<width$} {ascii}",
            address + (row * DUMP_WIDTH) as u64,
            hex.join(" "),
            width = DUMP_WIDTH * 3 - 1
        );
    }
}
