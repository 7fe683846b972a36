//! Zero-allocation formatting helpers and the level-filtered logging macros.
//!
//! Everything here may run inside a host process that is in the middle of a
//! `malloc` or holds loader locks, so formatting goes into caller-provided
//! stack buffers and never touches the heap.

use std::ffi::CStr;
use std::fmt;

/// Maximum length of one diagnostic line, newline included. Room for a
/// `PATH_MAX` path plus the prefix and the other call fields.
pub const LINE_BUF_SIZE: usize = libc::PATH_MAX as usize + 256;

/// Appended to a line that did not fit in [`LINE_BUF_SIZE`].
pub const TRUNCATION_MARKER: &str = "\u{2026}";

#[macro_export]
macro_rules! rim_log_at_level {
    ($level:expr, $($arg:tt)*) => {
        $crate::state::log_line($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! rim_trace { ($($arg:tt)*) => { $crate::rim_log_at_level!($crate::state::LogLevel::Trace, $($arg)*) }; }
#[macro_export]
macro_rules! rim_debug { ($($arg:tt)*) => { $crate::rim_log_at_level!($crate::state::LogLevel::Debug, $($arg)*) }; }
#[macro_export]
macro_rules! rim_info { ($($arg:tt)*) => { $crate::rim_log_at_level!($crate::state::LogLevel::Info, $($arg)*) }; }
#[macro_export]
macro_rules! rim_warn { ($($arg:tt)*) => { $crate::rim_log_at_level!($crate::state::LogLevel::Warn, $($arg)*) }; }
#[macro_export]
macro_rules! rim_error { ($($arg:tt)*) => { $crate::rim_log_at_level!($crate::state::LogLevel::Error, $($arg)*) }; }

/// `fmt::Write` sink over a fixed byte buffer. Output past the end is
/// dropped, cut on a UTF-8 character boundary.
pub struct StackWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    truncated: bool,
}

impl<'a> StackWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            truncated: false,
        }
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or("")
    }
}

impl fmt::Write for StackWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = self.buf.len() - self.pos;
        let mut to_copy = s.len();
        if to_copy > remaining {
            self.truncated = true;
            to_copy = remaining;
            while to_copy > 0 && !s.is_char_boundary(to_copy) {
                to_copy -= 1;
            }
        }
        self.buf[self.pos..self.pos + to_copy].copy_from_slice(&s.as_bytes()[..to_copy]);
        self.pos += to_copy;
        Ok(())
    }
}

/// Displays a C path argument on a single line: invalid UTF-8 becomes
/// U+FFFD, control characters and quotes are escaped, null prints `(null)`.
pub struct CPath(*const libc::c_char);

impl CPath {
    pub fn new(path: *const libc::c_char) -> Self {
        Self(path)
    }
}

impl fmt::Display for CPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_null() {
            return f.write_str("(null)");
        }
        // SAFETY: callers hand us the same pointer the host passed to libc,
        // which must be a NUL-terminated string for the call to be valid.
        let mut bytes = unsafe { CStr::from_ptr(self.0) }.to_bytes();
        loop {
            match std::str::from_utf8(bytes) {
                Ok(valid) => return write_escaped(f, valid),
                Err(e) => {
                    let (valid, rest) = bytes.split_at(e.valid_up_to());
                    // SAFETY: `valid_up_to` marks the end of a valid prefix.
                    write_escaped(f, unsafe { std::str::from_utf8_unchecked(valid) })?;
                    f.write_str("\u{FFFD}")?;
                    let skip = e.error_len().unwrap_or(rest.len());
                    bytes = &rest[skip..];
                }
            }
        }
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    for c in s.chars() {
        if c.is_control() || c == '"' || c == '\\' {
            write!(f, "{}", c.escape_default())?;
        } else {
            fmt::Write::write_char(f, c)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_stack_writer_truncates_on_char_boundary() {
        let mut buf = [0u8; 4];
        let mut w = StackWriter::new(&mut buf);
        // "é" is two bytes and would straddle the end of the buffer
        write!(w, "abcé").unwrap();
        assert_eq!(w.as_str(), "abc");
        write!(w, "x").unwrap();
        assert_eq!(w.as_str(), "abcx");
        assert!(w.is_truncated());
    }

    #[test]
    fn test_stack_writer_fits() {
        let mut buf = [0u8; 32];
        let mut w = StackWriter::new(&mut buf);
        write!(w, "fd={} flags={:#x}", 3, 0x200).unwrap();
        assert_eq!(w.as_str(), "fd=3 flags=0x200");
        assert!(!w.is_truncated());
    }

    #[test]
    fn test_cpath_null() {
        assert_eq!(CPath::new(std::ptr::null()).to_string(), "(null)");
    }

    #[test]
    fn test_cpath_escapes_newlines_and_quotes() {
        let p = c"/tmp/a\"b\nc";
        assert_eq!(CPath::new(p.as_ptr()).to_string(), "/tmp/a\\\"b\\nc");
    }

    #[test]
    fn test_cpath_replaces_invalid_utf8() {
        let p = c"/tmp/\xffname";
        assert_eq!(CPath::new(p.as_ptr()).to_string(), "/tmp/\u{FFFD}name");
    }
}
