//! A growable byte buffer with prependable headroom and scatter-read,
//! modeled on the three-region (prependable | readable | writable) layout
//! used by connection input/output buffers.

use std::io;
use std::os::unix::io::RawFd;

/// Bytes reserved in front of the readable region so headers can be
/// stamped on without a copy.
pub const CHEAP_PREPEND: usize = 8;
/// Initial size of the writable region.
pub const INITIAL_SIZE: usize = 1024;

const EXTRA_BUF_SIZE: usize = 65536;

/// A byte container split into prependable, readable and writable regions.
///
/// Invariant: `0 <= reader_index <= writer_index <= buf.len()`.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// View of the readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Advance the reader past `len` bytes of the readable region.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_until(&mut self, end: usize) {
        assert!(end >= self.reader_index && end <= self.writer_index);
        self.retrieve(end - self.reader_index);
    }

    /// Reset both offsets to the initial prepend boundary, recovering all
    /// headroom.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consume and return every readable byte.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Compact the readable region against the prepend boundary if that
    /// frees enough room; otherwise grow the backing storage. The initial
    /// prepend reserve is preserved either way.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    /// Move the reader back by `data.len()` and write `data` there. Used
    /// for late header stamping.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::with_capacity(self.readable_bytes() + reserve);
        other.append(self.peek());
        std::mem::swap(self, &mut other);
    }

    pub fn find_crlf(&self) -> Option<usize> {
        find_subslice(self.peek(), b"\r\n").map(|i| self.reader_index + i)
    }

    pub fn find_eol(&self) -> Option<usize> {
        self.peek()
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| self.reader_index + i)
    }

    // -- fixed-width integers, network byte order --

    pub fn append_u64(&mut self, x: u64) {
        self.append(&x.to_be_bytes());
    }
    pub fn append_u32(&mut self, x: u32) {
        self.append(&x.to_be_bytes());
    }
    pub fn append_u16(&mut self, x: u16) {
        self.append(&x.to_be_bytes());
    }
    pub fn append_u8(&mut self, x: u8) {
        self.append(&[x]);
    }

    pub fn peek_u64(&self) -> u64 {
        u64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }
    pub fn peek_u32(&self) -> u32 {
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }
    pub fn peek_u16(&self) -> u16 {
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }
    pub fn peek_u8(&self) -> u8 {
        self.peek()[0]
    }

    pub fn read_u64(&mut self) -> u64 {
        let x = self.peek_u64();
        self.retrieve(8);
        x
    }
    pub fn read_u32(&mut self) -> u32 {
        let x = self.peek_u32();
        self.retrieve(4);
        x
    }
    pub fn read_u16(&mut self) -> u16 {
        let x = self.peek_u16();
        self.retrieve(2);
        x
    }
    pub fn read_u8(&mut self) -> u8 {
        let x = self.peek_u8();
        self.retrieve(1);
        x
    }

    pub fn prepend_u64(&mut self, x: u64) {
        self.prepend(&x.to_be_bytes());
    }
    pub fn prepend_u32(&mut self, x: u32) {
        self.prepend(&x.to_be_bytes());
    }
    pub fn prepend_u16(&mut self, x: u16) {
        self.prepend(&x.to_be_bytes());
    }

    /// Scatter-read from `fd` into the writable region, spilling overflow
    /// into a stack buffer and appending it. This keeps the buffer small
    /// until a single read actually demands more than it currently holds.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: self.peek_mut_tail().as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra_buf.len(),
            },
        ];
        // Only offer the second iovec when the first might fill up;
        // matches the two-iovec trade-off of not over-allocating the
        // buffer for an oversized single read.
        let iovcnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_ptr(), iovcnt as libc::c_int))?;
        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra_buf[..n - writable]);
        }
        Ok(n)
    }

    fn peek_mut_tail(&mut self) -> &mut [u8] {
        let start = self.writer_index;
        &mut self.buf[start..]
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_layout() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_and_retrieve() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"hello");
        buf.retrieve(2);
        assert_eq!(buf.peek(), b"llo");
        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn grow_by_append() {
        let mut buf = Buffer::new();
        let big = vec![b'x'; INITIAL_SIZE * 4];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), big.len());
        assert!(buf.writable_bytes() < INITIAL_SIZE * 10);
    }

    /// Exercises growth/compaction across a spread of random sizes instead
    /// of one fixed number, the same randomized-size idiom the teacher's
    /// own test suite uses for buffer-shaped inputs.
    #[test]
    fn grow_and_retrieve_at_random_sizes() {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut buf = Buffer::new();
        for _ in 0..20 {
            let len: usize = rng.random_range(1..INITIAL_SIZE * 3);
            let chunk: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();
            buf.append(&chunk);
            assert_eq!(buf.peek(), &chunk[..]);
            buf.retrieve(len);
        }
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn compaction_preserves_prepend_reserve() {
        let mut buf = Buffer::new();
        buf.append(b"0123456789");
        buf.retrieve(5);
        // force compaction: readable(5) + writable(1014) >= 200 + CHEAP_PREPEND
        buf.append(&vec![b'y'; 200]);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(&buf.peek()[..5], b"56789");
    }

    #[test]
    fn prepend_int() {
        let mut buf = Buffer::new();
        buf.append(b"world");
        buf.prepend_u32(5);
        assert_eq!(buf.readable_bytes(), 9);
        assert_eq!(buf.peek_u32(), 5);
    }

    #[test]
    fn round_trip_integers() {
        let mut buf = Buffer::new();
        buf.append_u8(7);
        buf.append_u16(1234);
        buf.append_u32(0xdead_beef);
        buf.append_u64(0x0102_0304_0506_0708);
        assert_eq!(buf.read_u8(), 7);
        assert_eq!(buf.read_u16(), 1234);
        assert_eq!(buf.read_u32(), 0xdead_beef);
        assert_eq!(buf.read_u64(), 0x0102_0304_0506_0708);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn find_crlf_and_eol() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        let crlf = buf.find_crlf().unwrap();
        assert_eq!(&buf.peek()[..crlf - buf.reader_index], b"GET / HTTP/1.1");
        let eol = buf.find_eol().unwrap();
        assert_eq!(eol, crlf + 1);
    }

    #[test]
    fn read_from_fd_small_and_large() {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"hi").unwrap();
        let mut buf = Buffer::new();
        let n = buf.read_from_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf.peek(), b"hi");

        let big = vec![b'z'; INITIAL_SIZE + 4096];
        tx.write_all(&big).unwrap();
        let mut buf2 = Buffer::new();
        let n2 = buf2.read_from_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n2, big.len());
        assert_eq!(buf2.readable_bytes(), big.len());
    }
}
