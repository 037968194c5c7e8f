use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use uuid::Uuid;

/// A memory address as printed in a crash log.
///
/// Stored numerically so that comparisons (e.g. against the program
/// counter) ignore leading-zero differences in the source text, and
/// serialized back to the familiar `0x…` form.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Addr(pub u64);

impl Addr {
    /// Parses a `0x`-prefixed hex address.
    pub fn parse(s: &str) -> Option<Addr> {
        let digits = s.strip_prefix("0x")?;
        u64::from_str_radix(digits, 16).ok().map(Addr)
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Serialize for Addr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format!("0x{:x}", self.0).serialize(serializer)
    }
}

/// The parsed form of one crash log.
///
/// Built up in a single pass by the parser and treated as read-only by
/// everything downstream.
#[derive(Debug, Serialize, Default)]
pub struct CrashReport {
    /// Top-of-log `Key: value` metadata, in the order encountered.
    pub header: Vec<(String, String)>,
    /// One backtrace per thread section, in the order encountered.
    pub backtraces: Vec<Backtrace>,
    /// Loaded binary images, keyed by the basename of the image name.
    pub binary_images: BTreeMap<String, BinaryImage>,
    /// The crashing thread's `pc` register, if a register dump was found.
    pub program_counter: Option<Addr>,
    /// The crashing thread's `lr` register, if a register dump was found.
    pub link_register: Option<Addr>,
    /// Build UUID of the presumed main application binary.
    pub app_uuid: Option<Uuid>,
}

impl CrashReport {
    /// Looks up a header field by key, returning the first occurrence.
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn add_image(&mut self, image: BinaryImage) {
        self.note_app_image(&image);
        self.binary_images
            .insert(basename(&image.name).to_string(), image);
    }

    /// Policy: the first binary image listed in the log is assumed to be
    /// the host application, and its build UUID becomes [`app_uuid`].
    ///
    /// Crash logs list the host binary first in practice, but nothing in
    /// the format guarantees it; a stricter strategy (e.g. matching the
    /// image path against the process path) could replace this without
    /// touching the parser.
    ///
    /// [`app_uuid`]: CrashReport::app_uuid
    fn note_app_image(&mut self, image: &BinaryImage) {
        if self.app_uuid.is_none() {
            self.app_uuid = Some(image.uuid);
        }
    }
}

/// One thread's state at crash time.
#[derive(Debug, Serialize)]
pub struct Backtrace {
    /// Thread number as printed in the log.
    pub index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// True only for the thread whose section header says `Crashed`.
    pub crashed: bool,
    /// Stack frames, outermost call first (source order).
    pub frames: Vec<Frame>,
}

/// One stack entry: an address plus the binary and symbol text as printed.
#[derive(Debug, Serialize)]
pub struct Frame {
    pub addr: Addr,
    /// Raw binary name as printed in the frame line.
    pub module: String,
    /// Symbol name or raw offset text; no demangling is attempted.
    pub method: String,
}

/// One loaded executable or library.
#[derive(Debug, Serialize)]
pub struct BinaryImage {
    /// Load address.
    pub addr: Addr,
    /// Declared name field from the image line.
    pub name: String,
    pub uuid: Uuid,
    /// Full file path as printed in the log.
    pub path: String,
}

/// Formats a build UUID in its canonical form: hyphenated 8-4-4-4-12,
/// fully uppercase.
pub fn canonical_uuid(uuid: &Uuid) -> String {
    let mut buf = Uuid::encode_buffer();
    uuid.hyphenated().encode_upper(&mut buf).to_string()
}

pub(crate) fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}
