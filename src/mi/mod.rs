//! Client side of the debugger's machine interface.

/// The commands the engine sends.
pub mod command;

/// Parser for the records the debugger prints.
pub mod record;

/// The connection to the debugger and the demultiplexing of its output.
pub mod transport;

pub use command::Command;
pub use record::{AsyncKind, List, Record, ResultClass, StreamKind, Tuple, Value};
pub use transport::{Deadline, Delivery, Event, ListenerId, Polled, ResultRecord, Token, Transport};
