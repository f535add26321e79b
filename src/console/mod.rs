//! Console capture engine
//!
//! Mirrors a GNU screen session on a remote host by attaching briefly on a
//! timer, diffing successive screen images and fanning new lines out to a
//! ring buffer, the broadcast hub and an optional log file. Commands are
//! typed into the session with `screen -X stuff` after validation.

mod error;
pub mod filter;
mod log_writer;
mod manager;
pub mod ring_buffer;
pub mod screen;
mod session;

pub use error::ConsoleError;
pub use filter::{FilterMatch, FilterRequest, OutputFilter};
pub use log_writer::{cleanup_old_logs, server_log_dir, ConsoleLogWriter, LogWriterConfig};
pub use manager::{ConsoleManager, LogSettings, DEFAULT_HISTORY_LINES};
pub use ring_buffer::{RingBuffer, DEFAULT_BUFFER_LINES};
pub use screen::{safe_session_name, validate_command, CommandRejection, ScreenDiff};
pub use session::{CaptureSettings, CommandActor, ConnectionHandle, ConsoleSession, RunAs};
