// =============================================================================
// state.rs — Process-wide configuration and diagnostic output
// =============================================================================
//
// Configuration comes from the environment only and is read once by the
// module initializer (lib.rs). Parsing uses getenv + CStr, no allocation:
//
//   RIM_LOG_LEVEL  trace|debug|info|warn|error|off   (default: info)
//   RIM_LOG_FD     descriptor for diagnostic lines   (default: 2, <0 = none)
//   RIM_LIBC_PATH  library opened for on-demand symbol resolution
//
// Every emitted line also lands in LOGGER, an in-memory ring of the most
// recent output that can be dumped with rim_interceptor_dump_log().
// =============================================================================

use crate::macros::{StackWriter, LINE_BUF_SIZE, TRUNCATION_MARKER};
use libc::{c_char, c_int, c_void};
use std::ffi::CStr;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Off = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Off,
        }
    }

    /// Case-insensitive parse; anything unrecognised falls back to `Info`.
    pub fn parse(bytes: &[u8]) -> Self {
        if bytes.eq_ignore_ascii_case(b"trace") {
            LogLevel::Trace
        } else if bytes.eq_ignore_ascii_case(b"debug") {
            LogLevel::Debug
        } else if bytes.eq_ignore_ascii_case(b"warn") {
            LogLevel::Warn
        } else if bytes.eq_ignore_ascii_case(b"error") {
            LogLevel::Error
        } else if bytes.eq_ignore_ascii_case(b"off") {
            LogLevel::Off
        } else {
            LogLevel::Info
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }
}

pub static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
pub static LOG_FD: AtomicI32 = AtomicI32::new(libc::STDERR_FILENO);
static LIBRARY_OVERRIDE: AtomicPtr<c_char> = AtomicPtr::new(std::ptr::null_mut());

/// Reads the `RIM_*` environment variables. Called from the module
/// initializer before any symbol is primed.
pub(crate) unsafe fn init_from_env() {
    let level_ptr = libc::getenv(c"RIM_LOG_LEVEL".as_ptr());
    if !level_ptr.is_null() {
        let level = LogLevel::parse(CStr::from_ptr(level_ptr).to_bytes());
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }

    let fd_ptr = libc::getenv(c"RIM_LOG_FD".as_ptr());
    if !fd_ptr.is_null() {
        if let Some(fd) = parse_fd(CStr::from_ptr(fd_ptr).to_bytes()) {
            LOG_FD.store(fd, Ordering::Relaxed);
        }
    }

    let lib_ptr = libc::getenv(c"RIM_LIBC_PATH".as_ptr());
    if !lib_ptr.is_null() && *lib_ptr != 0 {
        LIBRARY_OVERRIDE.store(lib_ptr, Ordering::Release);
    }
}

fn parse_fd(bytes: &[u8]) -> Option<c_int> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

/// Library named by `RIM_LIBC_PATH`, if set.
pub fn library_override() -> Option<&'static CStr> {
    let p = LIBRARY_OVERRIDE.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        // SAFETY: the pointer comes from getenv and the environment block
        // outlives every caller of this crate.
        Some(unsafe { CStr::from_ptr(p) })
    }
}

#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 >= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Formats and emits one diagnostic line. The caller's `errno` is preserved.
pub fn log_line(level: LogLevel, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let saved_errno = crate::errno();

    let mut buf = [0u8; LINE_BUF_SIZE];
    // Keep room for the truncation marker and the newline.
    let body = LINE_BUF_SIZE - TRUNCATION_MARKER.len() - 1;
    let (mut len, truncated) = {
        use std::fmt::Write;
        let mut line = StackWriter::new(&mut buf[..body]);
        let pid = unsafe { libc::getpid() };
        let _ = write!(line, "[rim][{}][{}] ", pid, level.tag());
        let _ = line.write_fmt(args);
        (line.len(), line.is_truncated())
    };
    if truncated {
        buf[len..len + TRUNCATION_MARKER.len()].copy_from_slice(TRUNCATION_MARKER.as_bytes());
        len += TRUNCATION_MARKER.len();
    }
    buf[len] = b'\n';
    let msg = &buf[..=len];

    LOGGER.log(msg);
    let fd = LOG_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, msg.as_ptr() as *const c_void, msg.len());
        }
    }

    crate::set_errno(saved_errno);
}

pub const LOG_BUF_SIZE: usize = 64 * 1024;

/// Lock-free ring holding the most recent log output. Writers reserve a
/// byte range with one `fetch_add`, so concurrent lines never interleave
/// until the ring wraps over them.
///
/// Reads are best-effort: a range is reserved before its bytes are stored,
/// so a `snapshot` or `dump` racing a writer may copy that range while it
/// still holds older bytes. Lines whose writer returned before the read
/// started are always complete.
pub struct Logger<const N: usize = LOG_BUF_SIZE> {
    buffer: [AtomicU8; N],
    head: AtomicUsize,
}

impl<const N: usize> Default for Logger<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Logger<N> {
    pub const fn new() -> Self {
        Self {
            buffer: [const { AtomicU8::new(0) }; N],
            head: AtomicUsize::new(0),
        }
    }

    pub fn log(&self, msg: &[u8]) {
        let len = msg.len();
        if len > N {
            return;
        }
        let start = self.head.fetch_add(len, Ordering::AcqRel);
        for (i, b) in msg.iter().enumerate() {
            self.buffer[(start + i) % N].store(*b, Ordering::Relaxed);
        }
    }

    /// Total bytes ever logged, including those the ring has overwritten.
    pub fn written(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    /// Copies the newest bytes, oldest first, into `out`. Returns how many
    /// bytes were copied.
    pub fn snapshot(&self, out: &mut [u8]) -> usize {
        let head = self.written();
        let count = head.min(N).min(out.len());
        let start = head - count;
        for (i, slot) in out[..count].iter_mut().enumerate() {
            *slot = self.buffer[(start + i) % N].load(Ordering::Relaxed);
        }
        count
    }

    /// Writes the ring contents to `fd` in order.
    pub fn dump(&self, fd: c_int) {
        let head = self.written();
        let mut pos = head - head.min(N);
        let mut chunk = [0u8; 256];
        while pos < head {
            let n = (head - pos).min(chunk.len());
            for (i, slot) in chunk[..n].iter_mut().enumerate() {
                *slot = self.buffer[(pos + i) % N].load(Ordering::Relaxed);
            }
            unsafe {
                libc::write(fd, chunk.as_ptr() as *const c_void, n);
            }
            pos += n;
        }
    }
}

pub static LOGGER: Logger = Logger::new();
