//! The interactive terminal session: line editing, passthrough routing, and
//! command dispatch against a sandbox lifecycle.

pub mod commands;
pub mod dispatcher;
pub mod display;
pub mod key;
pub mod line_buffer;
pub mod passthrough;
pub mod render;
pub mod router;
pub mod session;
pub mod testing;

pub use commands::{Command, CommandMetadata, CommandRegistry, ParsedLine};
pub use dispatcher::{CommandDispatcher, CommandEffect};
pub use display::{DisplayOp, DisplaySurface, OutputSink};
pub use key::KeyInput;
pub use line_buffer::LineBuffer;
pub use passthrough::PassthroughStream;
pub use router::{InputMode, InputRouter, RouterAction};
pub use session::{Session, SessionControl, SessionSettings};
