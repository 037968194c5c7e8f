use std::borrow::Cow;
use std::io::{self, BufRead, BufReader, Read};
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::report::{Addr, Backtrace, BinaryImage, CrashReport, Frame};

lazy_static! {
    static ref KEY_VALUE_RE: Regex = Regex::new(
        r#"(?x)
        ^\s*(.*?)\s*:\s*(.*?)\s*$
    "#
    )
    .unwrap();
    static ref THREAD_NAME_RE: Regex = Regex::new(
        r#"(?x)
        ^Thread\ ([0-9]+)\ name:\s*(.+?)\s*$
    "#
    )
    .unwrap();
    static ref THREAD_RE: Regex = Regex::new(
        r#"(?x)
        ^Thread\ ([0-9]+)(\ Crashed)?:\s*$
    "#
    )
    .unwrap();
    static ref THREAD_STATE_RE: Regex = Regex::new(
        r#"(?x)
        ^Thread\ ([0-9]+)\ crashed\ with\ .*?\ Thread\ State
    "#
    )
    .unwrap();
    static ref REGISTER_RE: Regex = Regex::new(
        r#"(?x)
        ([a-z0-9]+):\s+
        (0x[0-9a-fA-F]+)
    "#
    )
    .unwrap();
    static ref FRAME_RE: Regex = Regex::new(
        r#"(?x)
        ^
            [0-9]+ \s+
            (\S+) \s+
            (0x[0-9a-fA-F]+) \s+
            (.+?)
            \s*
        $
    "#
    )
    .unwrap();
    static ref BINARY_IMAGE_RE: Regex = Regex::new(
        r#"(?x)
        ^
            \s*
            (0x[0-9a-fA-F]+) \s*
            -
            \s*
            (0x[0-9a-fA-F]+) \s+
            \+?(.+)\s+
            (\S+?)\s+
            (?:\(([^)]+?)\)\s+)?
            <([^>]+?)>\s+
            (.*?)
        $
    "#
    )
    .unwrap();
}

#[derive(Debug, Copy, Clone)]
enum ParsingState {
    Header,
    Thread,
    Registers,
    BinaryImages,
}

/// Outcome of offering a line to the current state's handler.
enum Step {
    /// The line was consumed; continue in the given state.
    Continue(ParsingState),
    /// The line belongs to the given state; hand it over unconsumed.
    Hold(ParsingState),
    /// End of the recognizable report body.
    Finish,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("io error during parsing")]
    Io(#[source] io::Error),
    #[error("stack frame outside of any thread section")]
    OrphanFrame,
    #[error("no crash report header found")]
    UnrecognizedFormat,
}

impl FromStr for CrashReport {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<CrashReport, ParseError> {
        CrashReport::from_line_iter(s.lines().map(|x| Ok(Cow::Borrowed(x))))
    }
}

impl CrashReport {
    /// Consumes a reader and parses it.
    pub fn from_reader<R: Read>(r: R) -> Result<CrashReport, ParseError> {
        let reader = BufReader::new(r);
        CrashReport::from_line_iter(reader.lines().map(|x| x.map(Cow::Owned)))
    }

    fn from_line_iter<'a, I: Iterator<Item = Result<Cow<'a, str>, io::Error>>>(
        iter: I,
    ) -> Result<CrashReport, ParseError> {
        let mut parser = Parser::default();
        let mut state = ParsingState::Header;

        'lines: for line in iter {
            let line = line.map_err(ParseError::Io)?;
            let line = line.trim();
            loop {
                match parser.step(state, line)? {
                    Step::Continue(next) => {
                        state = next;
                        continue 'lines;
                    }
                    Step::Hold(next) => state = next,
                    Step::Finish => break 'lines,
                }
            }
        }

        parser.finish()
    }
}

#[derive(Default)]
struct Parser {
    report: CrashReport,
    /// Backtrace currently being filled by the thread state. Reset on
    /// blank lines; a thread section always begins with a name or marker
    /// line, never mid-blank.
    current: Option<Backtrace>,
}

impl Parser {
    fn step(&mut self, state: ParsingState, line: &str) -> Result<Step, ParseError> {
        match state {
            ParsingState::Header => self.header_line(line),
            ParsingState::Thread => self.thread_line(line),
            ParsingState::Registers => Ok(self.registers_line(line)),
            ParsingState::BinaryImages => Ok(self.images_line(line)),
        }
    }

    fn header_line(&mut self, line: &str) -> Result<Step, ParseError> {
        if THREAD_NAME_RE.is_match(line) || THREAD_RE.is_match(line) {
            return Ok(Step::Hold(ParsingState::Thread));
        }
        // A stack frame this early has no thread section to belong to.
        if FRAME_RE.is_match(line) {
            return Err(ParseError::OrphanFrame);
        }
        if !line.is_empty() {
            if let Some(caps) = KEY_VALUE_RE.captures(line) {
                self.report
                    .header
                    .push((caps[1].to_string(), caps[2].to_string()));
            }
        }
        Ok(Step::Continue(ParsingState::Header))
    }

    fn thread_line(&mut self, line: &str) -> Result<Step, ParseError> {
        if line.is_empty() {
            self.flush_backtrace();
            return Ok(Step::Continue(ParsingState::Thread));
        }
        if THREAD_STATE_RE.is_match(line) {
            self.flush_backtrace();
            return Ok(Step::Continue(ParsingState::Registers));
        }
        if line.starts_with("Binary Images:") {
            self.flush_backtrace();
            return Ok(Step::Continue(ParsingState::BinaryImages));
        }
        if let Some(caps) = THREAD_NAME_RE.captures(line) {
            let Some(index) = parse_thread_index(&caps[1]) else {
                return Ok(Step::Continue(ParsingState::Thread));
            };
            // A name line while another section is still open starts a
            // new thread.
            self.flush_backtrace();
            self.current = Some(Backtrace {
                index,
                name: Some(caps[2].to_string()),
                crashed: false,
                frames: Vec::new(),
            });
            return Ok(Step::Continue(ParsingState::Thread));
        }
        if let Some(caps) = THREAD_RE.captures(line) {
            let Some(index) = parse_thread_index(&caps[1]) else {
                return Ok(Step::Continue(ParsingState::Thread));
            };
            let crashed = caps.get(2).is_some();
            // A marker following a name line for the same thread
            // annotates the pending backtrace rather than opening
            // another one. A marker for a different thread starts a
            // new section.
            let same_thread = self.current.as_ref().is_some_and(|b| b.index == index);
            if same_thread {
                if let Some(backtrace) = self.current.as_mut() {
                    backtrace.crashed |= crashed;
                }
            } else {
                self.flush_backtrace();
                self.current = Some(Backtrace {
                    index,
                    name: None,
                    crashed,
                    frames: Vec::new(),
                });
            }
            return Ok(Step::Continue(ParsingState::Thread));
        }
        if let Some(caps) = FRAME_RE.captures(line) {
            let backtrace = self.current.as_mut().ok_or(ParseError::OrphanFrame)?;
            match Addr::parse(&caps[2]) {
                Some(addr) => backtrace.frames.push(Frame {
                    addr,
                    module: caps[1].to_string(),
                    method: caps[3].to_string(),
                }),
                None => log::warn!("skipping frame with out-of-range address: {:?}", line),
            }
            return Ok(Step::Continue(ParsingState::Thread));
        }
        Ok(Step::Continue(ParsingState::Thread))
    }

    fn registers_line(&mut self, line: &str) -> Step {
        if line.starts_with("Binary Images:") {
            return Step::Continue(ParsingState::BinaryImages);
        }
        for caps in REGISTER_RE.captures_iter(line) {
            let Some(addr) = Addr::parse(&caps[2]) else {
                continue;
            };
            match &caps[1] {
                "pc" => self.report.program_counter = Some(addr),
                "lr" => self.report.link_register = Some(addr),
                _ => {}
            }
        }
        Step::Continue(ParsingState::Registers)
    }

    fn images_line(&mut self, line: &str) -> Step {
        if line.is_empty() || line == "EOF" {
            return Step::Finish;
        }
        if let Some(caps) = BINARY_IMAGE_RE.captures(line) {
            match (Addr::parse(&caps[1]), Uuid::parse_str(&caps[6])) {
                (Some(addr), Ok(uuid)) => {
                    self.report.add_image(BinaryImage {
                        addr,
                        name: caps[3].trim().to_string(),
                        uuid,
                        path: caps[7].to_string(),
                    });
                }
                _ => log::warn!("skipping binary image line with bad fields: {:?}", line),
            }
        } else {
            log::warn!("skipping unrecognized binary image line: {:?}", line);
        }
        Step::Continue(ParsingState::BinaryImages)
    }

    fn flush_backtrace(&mut self) {
        if let Some(backtrace) = self.current.take() {
            self.report.backtraces.push(backtrace);
        }
    }

    fn finish(mut self) -> Result<CrashReport, ParseError> {
        self.flush_backtrace();
        if self.report.header.is_empty() {
            return Err(ParseError::UnrecognizedFormat);
        }
        Ok(self.report)
    }
}

/// Thread numbers beyond `u64` are treated as unparseable; the line is
/// skipped rather than assigned an invented index.
fn parse_thread_index(digits: &str) -> Option<u64> {
    match digits.parse() {
        Ok(index) => Some(index),
        Err(_) => {
            log::warn!("skipping thread line with out-of-range index: {:?}", digits);
            None
        }
    }
}
