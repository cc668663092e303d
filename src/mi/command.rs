use std::fmt;

use super::record::escape;

/// The machine interface commands the engine issues.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    // Session
    SetAsync(bool),
    Connect { mode: String, remote: String },
    Exit,

    // Image
    LoadExecutable(String),
    Download,

    // Execution
    Continue,
    Interrupt,
    StepInstruction,

    // Breakpoints
    InsertBreakpoint {
        address: u32,
        hardware: bool,
        /// Deleted by the debugger when first hit.
        temporary: bool,
    },
    DeleteBreakpoint(u32),
    EnableBreakpoint(u32),
    DisableBreakpoint(u32),
    ListBreakpoints,

    // Data
    Evaluate(String),
    ReadMemory { address: u32, length: u32 },
    WriteMemory { address: u32, bytes: Vec<u8> },
    RegisterNames,
    RegisterValues(Vec<u32>),
    FunctionInfo(String),

    /// A command for the console interpreter, e.g. `monitor reset`.
    Console(String),
    Raw(String),
}

impl Command {
    /// The command text without token.
    pub fn to_mi(&self) -> String {
        match self {
            Command::SetAsync(on) => format!("-gdb-set mi-async {}", if *on { "on" } else { "off" }),
            Command::Connect { mode, remote } => format!("-target-select {} {}", mode, remote),
            Command::Exit => "-gdb-exit".to_string(),
            Command::LoadExecutable(path) => format!("-file-exec-and-symbols {}", quote(path)),
            Command::Download => "-target-download".to_string(),
            Command::Continue => "-exec-continue".to_string(),
            Command::Interrupt => "-exec-interrupt --all".to_string(),
            Command::StepInstruction => "-exec-step-instruction".to_string(),
            Command::InsertBreakpoint {
                address,
                hardware,
                temporary,
            } => {
                let mut text = "-break-insert".to_string();
                if *hardware {
                    text.push_str(" -h");
                }
                if *temporary {
                    text.push_str(" -t");
                }
                format!("{} *{:#010x}", text, address)
            }
            Command::DeleteBreakpoint(number) => format!("-break-delete {}", number),
            Command::EnableBreakpoint(number) => format!("-break-enable {}", number),
            Command::DisableBreakpoint(number) => format!("-break-disable {}", number),
            Command::ListBreakpoints => "-break-list".to_string(),
            Command::Evaluate(expression) => {
                format!("-data-evaluate-expression {}", quote(expression))
            }
            Command::ReadMemory { address, length } => {
                format!("-data-read-memory-bytes -o 0 {:#010x} {}", address, length)
            }
            Command::WriteMemory { address, bytes } => {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                format!("-data-write-memory-bytes {:#010x} \"{}\"", address, hex)
            }
            Command::RegisterNames => "-data-list-register-names".to_string(),
            Command::RegisterValues(numbers) => {
                let mut text = "-data-list-register-values x".to_string();
                for number in numbers {
                    text.push_str(&format!(" {}", number));
                }
                text
            }
            Command::FunctionInfo(name) => {
                format!("-symbol-info-functions --name ^{}$", name)
            }
            Command::Console(command) => format!("-interpreter-exec console {}", quote(command)),
            Command::Raw(text) => text.clone(),
        }
    }

    /// True for commands that let the target execute.
    pub fn resumes_target(&self) -> bool {
        matches!(self, Command::Continue | Command::StepInstruction)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_mi())
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", escape(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_commands() {
        assert_eq!(
            Command::Evaluate("&example_GetA".into()).to_mi(),
            "-data-evaluate-expression \"&example_GetA\""
        );
        assert_eq!(
            Command::InsertBreakpoint {
                address: 0x800_0200,
                hardware: false,
                temporary: false,
            }
            .to_mi(),
            "-break-insert *0x08000200"
        );
        assert_eq!(
            Command::InsertBreakpoint {
                address: 0x800_0780,
                hardware: true,
                temporary: true,
            }
            .to_mi(),
            "-break-insert -h -t *0x08000780"
        );
        assert_eq!(
            Command::WriteMemory {
                address: 0x2000_0000,
                bytes: vec![0x2a, 0, 0, 0xff]
            }
            .to_mi(),
            "-data-write-memory-bytes 0x20000000 \"2a0000ff\""
        );
        assert_eq!(
            Command::Console("ptype/o \"my\" struct".into()).to_mi(),
            "-interpreter-exec console \"ptype/o \\\"my\\\" struct\""
        );
        assert_eq!(
            Command::RegisterValues(vec![0, 15]).to_mi(),
            "-data-list-register-values x 0 15"
        );
    }
}
