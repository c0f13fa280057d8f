//! Diagnostics that never touch the allocator.
//!
//! Anything in here may run while the heap is locked, half-constructed, or
//! being patched underneath us, so formatting happens into a fixed stack
//! buffer and goes straight to fd 2.

use std::ffi::CStr;

const LINE_CAPACITY: usize = 256;

/// A fixed-capacity line. Output past the capacity is silently truncated.
pub struct Line {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl Line {
    pub const fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(LINE_CAPACITY - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }

    pub fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    pub fn push_usize(&mut self, mut n: usize) {
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        self.push_bytes(&digits[i..]);
    }

    pub fn push_hex(&mut self, mut n: usize) {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut digits = [0u8; 16];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = HEX[n & 0xf];
            n >>= 4;
            if n == 0 {
                break;
            }
        }
        self.push_str("0x");
        self.push_bytes(&digits[i..]);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Write the line to stderr. Errors are dropped, there is nowhere to
    /// report them.
    pub fn flush(&self) {
        write_stderr(self.as_bytes());
    }
}

impl Default for Line {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn write_stderr(bytes: &[u8]) {
    let mut rest = bytes;
    while !rest.is_empty() {
        // SAFETY: `rest` is a valid, initialised byte slice.
        let n = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
        if n <= 0 {
            return;
        }
        rest = &rest[n as usize..];
    }
}

#[cfg(not(unix))]
fn write_stderr(bytes: &[u8]) {
    use std::io::Write;
    // `Stderr` is unbuffered and its lock is a static, so this doesn't
    // allocate either.
    let _ = std::io::stderr().write_all(bytes);
}

/// Something that can be appended to a [`Line`].
pub trait Put {
    fn put(&self, line: &mut Line);
}

impl Put for &str {
    fn put(&self, line: &mut Line) {
        line.push_str(self);
    }
}

impl Put for &CStr {
    fn put(&self, line: &mut Line) {
        line.push_bytes(self.to_bytes());
    }
}

impl Put for usize {
    fn put(&self, line: &mut Line) {
        line.push_usize(*self);
    }
}

impl Put for u32 {
    fn put(&self, line: &mut Line) {
        line.push_usize(*self as usize);
    }
}

impl Put for i32 {
    fn put(&self, line: &mut Line) {
        if *self < 0 {
            line.push_str("-");
        }
        line.push_usize(self.unsigned_abs() as usize);
    }
}

impl Put for bool {
    fn put(&self, line: &mut Line) {
        line.push_str(if *self { "true" } else { "false" });
    }
}

impl<T> Put for *const T {
    fn put(&self, line: &mut Line) {
        line.push_hex(*self as usize);
    }
}

impl<T> Put for *mut T {
    fn put(&self, line: &mut Line) {
        line.push_hex(*self as usize);
    }
}

/// Print all arguments to stderr followed by a newline, without allocating.
///
/// ```
/// heapswap::putln!("arena used ", 128usize, " of ", 65536usize);
/// ```
#[macro_export]
macro_rules! putln {
    ($($arg:expr),* $(,)?) => {{
        let mut line = $crate::util::print::Line::new();
        $( $crate::util::print::Put::put(&$arg, &mut line); )*
        line.push_str("\n");
        line.flush();
    }};
}

/// Like [`putln!`], prefixed, and compiled out unless the `trace` feature is
/// on.
macro_rules! trace {
    ($($arg:expr),* $(,)?) => {
        #[cfg(feature = "trace")]
        {
            $crate::putln!("[heapswap] ", $($arg),*);
        }
    };
}
pub(crate) use trace;
