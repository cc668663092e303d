//! A scripted debugger emulating a Cortex-M target that runs the example firmware.
//!
//! The firmware functions are emulated one "instruction" at a time, which is enough for
//! breakpoints, single steps and calls to behave like on hardware.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, BufReader, Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

use rust_dott::mi::record::escape;
use rust_dott::mi::Transport;
use rust_dott::{MemoryModel, SessionConfig, TargetSession};

pub const RESET_HANDLER: u32 = 0x0800_0000;
pub const MAIN: u32 = 0x0800_0050;
pub const ADDITION: u32 = 0x0800_0100;
pub const GET_A: u32 = 0x0800_0200;
pub const GET_B: u32 = 0x0800_0300;
pub const ADDITION_SUBCALLS: u32 = 0x0800_0400;
pub const ADDITION_STRUCT: u32 = 0x0800_0500;
pub const ADDITION_PTR: u32 = 0x0800_0600;
pub const HOOK_CHAINED: u32 = 0x0800_0700;
pub const HOOK: u32 = 0x0800_0780;

pub const GLOBAL_DATA: u32 = 0x2000_0000;
pub const HOOK_BUFFER: u32 = 0x2000_9000;
pub const HOOK_BUFFER_SIZE: u32 = 0x100;
pub const SRAM_BASE: u32 = 0x2000_8000;
pub const SRAM_SIZE: u32 = 0x400;
pub const INITIAL_SP: u32 = 0x2001_0000;

const REGISTER_NAMES: [&str; 19] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc", "xpsr", "msp", "psp",
];
const SP: usize = 13;
const LR: usize = 14;
const PC: usize = 15;
const XPSR: usize = 16;

const FUNCTIONS: [(&str, u32, &str); 10] = [
    ("Reset_Handler", RESET_HANDLER, "void (void)"),
    ("main", MAIN, "int (void)"),
    ("example_Addition", ADDITION, "uint32_t (uint32_t, uint32_t)"),
    ("example_GetA", GET_A, "uint32_t (void)"),
    ("example_GetB", GET_B, "uint32_t (uint32_t *)"),
    ("example_AdditionSubcalls", ADDITION_SUBCALLS, "uint32_t (void)"),
    ("example_AdditionStruct", ADDITION_STRUCT, "uint32_t (my_add_t *)"),
    (
        "example_AdditionPtr",
        ADDITION_PTR,
        "void (uint32_t, uint32_t, uint32_t *)",
    ),
    ("DOTT_test_hook_chained", HOOK_CHAINED, "void (uint8_t *, uint32_t)"),
    ("DOTT_test_hook", HOOK, "void (void)"),
];

const MY_ADD_T: &str = "/* offset      |    size */  type = struct {
/*      0      |       1 */    uint8_t paddA;
/* XXX  3-byte hole      */
/*      4      |       4 */    uint32_t a;
/*      8      |       1 */    uint8_t paddB;
/* XXX  3-byte hole      */
/*     12      |       4 */    uint32_t b;
/*     16      |       1 */    uint8_t paddC;
/* XXX  3-byte hole      */
/*     20      |       4 */    uint32_t sum;

                               /* total size (bytes):   24 */
                             }
";

/// What the test can observe and break.
#[derive(Default)]
pub struct Control {
    /// Every command received, without its token.
    pub log: Vec<String>,
    /// Commands starting with one of these are never answered.
    pub stall: Vec<String>,
    /// The debugger dies on a command starting with one of these.
    pub crash: Vec<String>,
}

#[derive(Clone, Default)]
pub struct Shared(Arc<Mutex<Control>>);

impl Shared {
    pub fn log(&self) -> Vec<String> {
        self.0.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.0.lock().unwrap().log.clear();
    }

    /// Number of logged commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn stall(&self, prefix: &str) {
        self.0.lock().unwrap().stall.push(prefix.to_string());
    }

    pub fn crash(&self, prefix: &str) {
        self.0.lock().unwrap().crash.push(prefix.to_string());
    }
}

#[derive(Debug, Clone)]
struct Breakpoint {
    number: u32,
    address: u32,
    enabled: bool,
    hardware: bool,
    temporary: bool,
}

enum Outcome {
    Executed,
    /// `b .`, the target spins.
    Idle,
    Fault,
}

enum Stop {
    Breakpoint(u32),
    Stepped,
    Fault,
    Running,
}

/// The emulated target and the debugger around it.
pub struct FakeTarget {
    regs: [u32; 19],
    memory: HashMap<u32, u8>,
    breakpoints: Vec<Breakpoint>,
    next_breakpoint: u32,
    last_stop: Option<u32>,
    running: bool,
    control: Shared,
}

impl FakeTarget {
    pub fn new() -> FakeTarget {
        let mut target = FakeTarget {
            regs: [0; 19],
            memory: HashMap::new(),
            breakpoints: vec![],
            next_breakpoint: 1,
            last_stop: None,
            running: false,
            control: Shared::default(),
        };
        target.write32(GLOBAL_DATA, 7);
        target.reset();
        target
    }

    /// A breakpoint the engine did not insert.
    pub fn with_foreign_breakpoint(mut self, address: u32) -> FakeTarget {
        self.insert_breakpoint(address, false, false);
        self
    }

    /// Starts the debugger thread.
    pub fn spawn(self) -> (Transport, Shared) {
        let control = self.control.clone();
        let (command_tx, command_rx) = unbounded();
        let (output_tx, output_rx) = unbounded();
        thread::Builder::new()
            .name("fake-gdb".to_string())
            .spawn(move || self.serve(command_rx, output_tx))
            .unwrap();
        let transport = Transport::from_io(
            CommandPipe(command_tx, vec![]),
            BufReader::new(OutputPipe(output_rx, Cursor::new(vec![]))),
        );
        (transport, control)
    }

    fn serve(mut self, commands: Receiver<String>, output: Sender<String>) {
        for line in commands.iter() {
            let split = line
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or_else(|| line.len());
            let (token, command) = line.split_at(split);
            let command = command.trim().to_string();
            {
                let mut control = self.control.0.lock().unwrap();
                control.log.push(command.clone());
                if control.crash.iter().any(|p| command.starts_with(p.as_str())) {
                    return;
                }
                if control.stall.iter().any(|p| command.starts_with(p.as_str())) {
                    continue;
                }
            }
            let mut lines = self.handle(token, &command);
            lines.push("(gdb)".to_string());
            for line in lines {
                if output.send(format!("{}\n", line)).is_err() {
                    return;
                }
            }
            if command == "-gdb-exit" {
                return;
            }
        }
    }

    fn handle(&mut self, token: &str, command: &str) -> Vec<String> {
        let done = |results: &str| {
            if results.is_empty() {
                format!("{}^done", token)
            } else {
                format!("{}^done,{}", token, results)
            }
        };
        let error = |message: &str| format!("{}^error,msg=\"{}\"", token, escape(message));
        let (name, rest) = match command.find(' ') {
            Some(i) => (&command[..i], command[i + 1..].trim()),
            None => (command, ""),
        };

        match name {
            "-gdb-set" | "-file-exec-and-symbols" | "-target-download" => vec![done("")],
            "-target-select" => vec![format!("{}^connected", token)],
            "-gdb-exit" => vec![format!("{}^exit", token)],
            "-interpreter-exec" => {
                let console = unquote(rest.trim_start_matches("console").trim());
                self.console(&console, token)
            }
            "-data-evaluate-expression" => match self.evaluate(&unquote(rest)) {
                Ok(value) => vec![done(&format!("value=\"{}\"", escape(&value)))],
                Err(message) => vec![error(&message)],
            },
            "-data-read-memory-bytes" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let address = number(parts[2]);
                let length = number(parts[3]);
                let contents: String = (0..length)
                    .map(|i| format!("{:02x}", self.read8(address + i)))
                    .collect();
                vec![done(&format!(
                    "memory=[{{begin=\"{:#x}\",offset=\"0x00000000\",end=\"{:#x}\",contents=\"{}\"}}]",
                    address,
                    address + length,
                    contents
                ))]
            }
            "-data-write-memory-bytes" => {
                let mut parts = rest.splitn(2, ' ');
                let address = number(parts.next().unwrap_or("0"));
                let hex = unquote(parts.next().unwrap_or("\"\""));
                for i in 0..hex.len() / 2 {
                    let byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).unwrap();
                    self.memory.insert(address + i as u32, byte);
                }
                vec![done("")]
            }
            "-data-list-register-names" => {
                let names: Vec<String> =
                    REGISTER_NAMES.iter().map(|n| format!("\"{}\"", n)).collect();
                vec![done(&format!("register-names=[{}]", names.join(",")))]
            }
            "-data-list-register-values" => {
                let values: Vec<String> = rest
                    .split_whitespace()
                    .skip(1)
                    .map(|n| {
                        let n: usize = n.parse().unwrap();
                        format!("{{number=\"{}\",value=\"{:#x}\"}}", n, self.regs[n])
                    })
                    .collect();
                vec![done(&format!("register-values=[{}]", values.join(",")))]
            }
            "-symbol-info-functions" => {
                let wanted = rest
                    .trim_start_matches("--name")
                    .trim()
                    .trim_start_matches('^')
                    .trim_end_matches('$');
                match FUNCTIONS.iter().find(|(name, _, _)| *name == wanted) {
                    Some((name, _, ty)) => vec![done(&format!(
                        "symbols={{debug=[{{filename=\"examples.c\",fullname=\"/src/examples.c\",symbols=[{{line=\"10\",name=\"{}\",type=\"{}\",description=\"{} {};\"}}]}}]}}",
                        name, ty, ty, name
                    ))],
                    None => vec![done("symbols={}")],
                }
            }
            "-break-insert" => {
                let mut hardware = false;
                let mut temporary = false;
                let mut address = 0;
                for part in rest.split_whitespace() {
                    match part {
                        "-h" => hardware = true,
                        "-t" => temporary = true,
                        location => address = number(location.trim_start_matches('*')),
                    }
                }
                let number = self.insert_breakpoint(address, hardware, temporary);
                vec![done(&format!(
                    "bkpt={{number=\"{}\",type=\"{}\",disp=\"{}\",enabled=\"y\",addr=\"{:#010x}\",times=\"0\"}}",
                    number,
                    if hardware { "hw breakpoint" } else { "breakpoint" },
                    if temporary { "del" } else { "keep" },
                    address
                ))]
            }
            "-break-delete" | "-break-enable" | "-break-disable" => {
                let number: u32 = rest.parse().unwrap_or(0);
                let index = match self.breakpoints.iter().position(|b| b.number == number) {
                    Some(index) => index,
                    None => return vec![error(&format!("Bad breakpoint number '{}'", rest))],
                };
                match name {
                    "-break-delete" => {
                        self.breakpoints.remove(index);
                    }
                    "-break-enable" => self.breakpoints[index].enabled = true,
                    _ => self.breakpoints[index].enabled = false,
                }
                vec![done("")]
            }
            "-break-list" => {
                let body: Vec<String> = self
                    .breakpoints
                    .iter()
                    .map(|b| {
                        format!(
                            "bkpt={{number=\"{}\",type=\"breakpoint\",disp=\"keep\",enabled=\"{}\",addr=\"{:#010x}\",times=\"0\"}}",
                            b.number,
                            if b.enabled { "y" } else { "n" },
                            b.address
                        )
                    })
                    .collect();
                vec![done(&format!(
                    "BreakpointTable={{nr_rows=\"{}\",nr_cols=\"6\",hdr=[{{width=\"3\",alignment=\"-1\",col_name=\"number\",colhdr=\"Num\"}}],body=[{}]}}",
                    body.len(),
                    body.join(",")
                ))]
            }
            "-exec-continue" | "-exec-step-instruction" => {
                if self.running {
                    return vec![error("The program is already running.")];
                }
                let mut lines = vec![
                    format!("{}^running", token),
                    "*running,thread-id=\"all\"".to_string(),
                ];
                let stop = self.run(name == "-exec-step-instruction");
                if let Some(line) = self.stop_record(stop) {
                    lines.push(line);
                }
                lines
            }
            "-exec-interrupt" => {
                if !self.running {
                    return vec![error("Cannot execute this command while the selected thread is stopped.")];
                }
                self.running = false;
                let pc = self.regs[PC];
                self.last_stop = Some(pc);
                vec![
                    done(""),
                    format!(
                        "*stopped,reason=\"signal-received\",signal-name=\"SIGINT\",signal-meaning=\"Interrupt\",frame={},thread-id=\"1\",stopped-threads=\"all\"",
                        frame(pc)
                    ),
                ]
            }
            _ => vec![error(&format!("Undefined MI command: {}", name))],
        }
    }

    fn console(&mut self, command: &str, token: &str) -> Vec<String> {
        let stream = |text: &str| -> Vec<String> {
            text.lines()
                .map(|line| format!("~\"{}\"", escape(&format!("{}\n", line))))
                .collect()
        };
        let mut lines = match command {
            "set mem inaccessible-by-default off" => vec![],
            "monitor reset" => {
                self.reset();
                stream("Resetting target")
            }
            "flushregs" => stream("Register cache flushed."),
            _ if command.starts_with("whatis ") => {
                let name = command.trim_start_matches("whatis ").trim();
                match FUNCTIONS.iter().find(|(n, _, _)| *n == name) {
                    Some((_, _, ty)) => stream(&format!("type = {}", ty)),
                    None => {
                        return vec![format!(
                            "{}^error,msg=\"{}\"",
                            token,
                            escape(&format!("No symbol \"{}\" in current context.", name))
                        )]
                    }
                }
            }
            _ => match command.strip_prefix("ptype/o ") {
                Some("my_add_t") => stream(MY_ADD_T),
                Some("uint32_t") | Some("global_data") => stream("type = unsigned int"),
                Some("uint8_t") => stream("type = unsigned char"),
                Some("int") => stream("type = int"),
                Some(other) => {
                    return vec![format!(
                        "{}^error,msg=\"{}\"",
                        token,
                        escape(&format!("No symbol \"{}\" in current context.", other))
                    )]
                }
                None => {
                    return vec![format!(
                        "{}^error,msg=\"Undefined command: \\\"{}\\\".\"",
                        token,
                        escape(command)
                    )]
                }
            },
        };
        lines.push(format!("{}^done", token));
        lines
    }

    fn evaluate(&mut self, expression: &str) -> Result<String, String> {
        let no_symbol = |name: &str| Err(format!("No symbol \"{}\" in current context.", name));
        if let Some(name) = expression.strip_prefix('&') {
            if let Some((name, address, ty)) = FUNCTIONS.iter().find(|(n, _, _)| *n == name) {
                let (ret, params) = ty.split_at(ty.find(" (").unwrap_or(0));
                return Ok(format!("({} (*){}) {:#x} <{}>", ret, params.trim(), address, name));
            }
            if name == "global_data" {
                return Ok(format!("(uint32_t *) {:#x} <global_data>", GLOBAL_DATA));
            }
            return no_symbol(name);
        }
        if let Some(inner) = expression
            .strip_prefix("sizeof(")
            .and_then(|e| e.strip_suffix(')'))
        {
            return match inner {
                "uint8_t" => Ok("1".to_string()),
                "uint32_t" | "int" | "global_data" => Ok("4".to_string()),
                "my_add_t" => Ok("24".to_string()),
                other => no_symbol(other),
            };
        }
        if let Some(index) = expression.find(" = ") {
            let (lvalue, value) = (&expression[..index], &expression[index + 3..]);
            let value = parse_literal(value).ok_or_else(|| format!("Invalid number \"{}\".", value))?;
            if let Some(register) = lvalue.strip_prefix('$') {
                let n = REGISTER_NAMES
                    .iter()
                    .position(|r| *r == register)
                    .ok_or_else(|| format!("Invalid register `{}'", register))?;
                self.regs[n] = value;
                return Ok(value.to_string());
            }
            if lvalue == "global_data" {
                self.write32(GLOBAL_DATA, value);
                return Ok(value.to_string());
            }
            return no_symbol(lvalue);
        }
        if let Some(register) = expression.strip_prefix('$') {
            return match REGISTER_NAMES.iter().position(|r| *r == register) {
                Some(n) => Ok(self.regs[n].to_string()),
                None => Ok("void".to_string()),
            };
        }
        match expression {
            "global_data" => Ok(self.read32(GLOBAL_DATA).to_string()),
            "greeting" => Ok("0x8000800 \"hello\"".to_string()),
            "global_add" => Ok(format!(
                "{{paddA = 0 '\\000', a = {}, paddB = 0 '\\000', b = 11, sum = 42}}",
                31
            )),
            other => no_symbol(other),
        }
    }

    fn reset(&mut self) {
        self.regs = [0; 19];
        self.regs[SP] = INITIAL_SP;
        self.regs[LR] = 0xffff_ffff;
        self.regs[PC] = RESET_HANDLER;
        self.regs[XPSR] = 0x0100_0000;
        self.running = false;
        self.last_stop = Some(RESET_HANDLER);
    }

    fn insert_breakpoint(&mut self, address: u32, hardware: bool, temporary: bool) -> u32 {
        let number = self.next_breakpoint;
        self.next_breakpoint += 1;
        self.breakpoints.push(Breakpoint {
            number,
            address,
            enabled: true,
            hardware,
            temporary,
        });
        number
    }

    fn breakpoint_at(&self, address: u32) -> Option<u32> {
        self.breakpoints
            .iter()
            .find(|b| b.enabled && b.address == address)
            .map(|b| b.number)
    }

    fn run(&mut self, single: bool) -> Stop {
        let mut first = true;
        for _ in 0..10_000 {
            let pc = self.regs[PC];
            if !(first && self.last_stop == Some(pc)) {
                if let Some(number) = self.breakpoint_at(pc) {
                    return Stop::Breakpoint(number);
                }
            }
            if single && !first {
                return Stop::Stepped;
            }
            first = false;
            match self.execute() {
                Outcome::Executed => (),
                Outcome::Idle if single => return Stop::Stepped,
                Outcome::Idle => return Stop::Running,
                Outcome::Fault => return Stop::Fault,
            }
            if single {
                return Stop::Stepped;
            }
        }
        Stop::Fault
    }

    fn stop_record(&mut self, stop: Stop) -> Option<String> {
        let pc = self.regs[PC];
        let reason = match stop {
            Stop::Running => {
                self.running = true;
                return None;
            }
            Stop::Breakpoint(number) => {
                let temporary = self
                    .breakpoints
                    .iter()
                    .any(|b| b.number == number && b.temporary);
                if temporary {
                    self.breakpoints.retain(|b| b.number != number);
                }
                format!(
                    "reason=\"breakpoint-hit\",disp=\"{}\",bkptno=\"{}\"",
                    if temporary { "del" } else { "keep" },
                    number
                )
            }
            Stop::Stepped => "reason=\"end-stepping-range\"".to_string(),
            Stop::Fault => "reason=\"signal-received\",signal-name=\"SIGSEGV\",signal-meaning=\"Segmentation fault\"".to_string(),
        };
        self.last_stop = Some(pc);
        Some(format!(
            "*stopped,{},frame={},thread-id=\"1\",stopped-threads=\"all\"",
            reason,
            frame(pc)
        ))
    }

    /// Executes the instruction at the program counter.
    fn execute(&mut self) -> Outcome {
        let pc = self.regs[PC];
        let sp = self.regs[SP];
        match pc {
            RESET_HANDLER => self.regs[PC] = MAIN,
            MAIN => {
                self.regs[0] = HOOK_BUFFER;
                self.regs[1] = HOOK_BUFFER_SIZE;
                self.regs[LR] = (MAIN + 4) | 1;
                self.regs[PC] = HOOK_CHAINED;
            }
            x if x == MAIN + 4 => return Outcome::Idle,
            HOOK_CHAINED => self.regs[PC] = HOOK,
            HOOK => self.ret(),
            ADDITION => {
                self.regs[0] = self.regs[0].wrapping_add(self.regs[1]);
                self.ret();
            }
            GET_A => {
                self.regs[0] = 42;
                self.ret();
            }
            GET_B => {
                self.write32(self.regs[0], 21);
                self.regs[0] = 0;
                self.ret();
            }
            ADDITION_SUBCALLS => {
                let sp = sp - 16;
                self.regs[SP] = sp;
                self.write32(sp + 12, self.regs[LR]);
                self.regs[LR] = (ADDITION_SUBCALLS + 4) | 1;
                self.regs[PC] = GET_A;
            }
            x if x == ADDITION_SUBCALLS + 4 => {
                self.write32(sp, self.regs[0]);
                self.write32(sp + 4, 0);
                self.regs[0] = sp + 4;
                self.regs[LR] = (ADDITION_SUBCALLS + 8) | 1;
                self.regs[PC] = GET_B;
            }
            x if x == ADDITION_SUBCALLS + 8 => {
                self.regs[0] = self
                    .read32(sp)
                    .wrapping_add(self.read32(sp + 4))
                    .wrapping_add(self.regs[0]);
                self.regs[LR] = self.read32(sp + 12);
                self.regs[SP] = sp + 16;
                self.ret();
            }
            ADDITION_STRUCT => {
                let p = self.regs[0];
                let sum = self.read32(p + 4).wrapping_add(self.read32(p + 12));
                self.write32(p + 20, sum);
                self.regs[0] = sum;
                self.ret();
            }
            ADDITION_PTR => {
                self.write32(self.regs[2], self.regs[0].wrapping_add(self.regs[1]));
                self.ret();
            }
            x if (x == SRAM_BASE || x == SRAM_BASE + 2)
                && self.read8(x) == 0x00
                && self.read8(x + 1) == 0xbf =>
            {
                self.regs[PC] = x + 2;
            }
            _ => return Outcome::Fault,
        }
        Outcome::Executed
    }

    fn ret(&mut self) {
        self.regs[PC] = self.regs[LR] & !1;
    }

    fn read8(&self, address: u32) -> u8 {
        self.memory.get(&address).copied().unwrap_or(0)
    }

    fn read32(&self, address: u32) -> u32 {
        (0..4).fold(0, |acc, i| acc | (u32::from(self.read8(address + i)) << (8 * i)))
    }

    fn write32(&mut self, address: u32, value: u32) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.memory.insert(address + i as u32, *byte);
        }
    }
}

fn frame(pc: u32) -> String {
    let func = FUNCTIONS
        .iter()
        .find(|(_, address, _)| *address == pc)
        .map(|(name, _, _)| *name)
        .unwrap_or("??");
    format!("{{addr=\"{:#010x}\",func=\"{}\",args=[]}}", pc, func)
}

fn number(text: &str) -> u32 {
    let text = text.trim();
    match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).unwrap(),
        None => text.parse().unwrap(),
    }
}

fn parse_literal(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(negative) = text.strip_prefix('-') {
        return negative.parse::<i64>().ok().map(|v| (-v) as u32);
    }
    match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse::<u64>().ok().map(|v| v as u32),
    }
}

/// Removes the quotes and escapes of a c-string argument.
fn unquote(text: &str) -> String {
    let text = text.trim();
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text);
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => (),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Forwards whole command lines to the debugger thread.
struct CommandPipe(Sender<String>, Vec<u8>);

impl Write for CommandPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.1.extend_from_slice(buf);
        while let Some(end) = self.1.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.1.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line).trim_end().to_string();
            self.0
                .send(line)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "debugger gone"))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hands the debugger's output to the transport's reader.
struct OutputPipe(Receiver<String>, Cursor<Vec<u8>>);

impl Read for OutputPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.1.position() as usize >= self.1.get_ref().len() {
            match self.0.recv() {
                Ok(line) => self.1 = Cursor::new(line.into_bytes()),
                Err(_) => return Ok(0),
            }
        }
        self.1.read(buf)
    }
}

pub fn sram_config() -> SessionConfig {
    SessionConfig {
        memory_model: MemoryModel::Sram {
            base: SRAM_BASE,
            size: SRAM_SIZE,
            halt_location: "main".to_string(),
        },
        command_timeout_ms: 2000,
        run_timeout_ms: 2000,
        ..SessionConfig::default()
    }
}

pub fn connect(target: FakeTarget, config: SessionConfig) -> (TargetSession, Shared) {
    let (transport, control) = target.spawn();
    let session = TargetSession::with_transport(transport, config).unwrap();
    (session, control)
}

/// A session on a reset target using the SRAM memory model.
pub fn ready() -> (TargetSession, Shared) {
    let (mut session, control) = connect(FakeTarget::new(), sram_config());
    session.reset().unwrap();
    control.clear_log();
    (session, control)
}
