//! This library implements a parser for the apple crash report text
//! format, a formatter that maps the parsed report into a crash event
//! payload, and a transport that delivers the payload to a crash
//! aggregation endpoint.
//!
//! The three pieces form a linear pipeline:
//!
//! ```no_run
//! use apple_crash_report_uploader::{CrashReport, Formatter, Notifier, Transport};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let text = std::fs::read_to_string("crash.txt")?;
//! let report: CrashReport = text.parse()?;
//! let payload = Formatter::new(Notifier::default()).format(&report)?;
//! Transport::new("https://notify.bugsnag.com/".parse()?, "api-key")?.deliver(&payload)?;
//! # Ok(())
//! # }
//! ```
mod format;
mod parser;
mod report;
mod transport;

pub use crate::format::{
    App, Device, Event, Exception, FormatError, Formatter, FrameView, MetaData, Notifier, Payload,
    SeverityReason, ThreadView,
};
pub use crate::parser::ParseError;
pub use crate::report::{canonical_uuid, Addr, Backtrace, BinaryImage, CrashReport, Frame};
pub use crate::transport::{DeliveryError, Transport, DEFAULT_ENDPOINT};
