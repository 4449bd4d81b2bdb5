const DEFAULT_CAPACITY: usize = 1024;

/// Growable byte buffer with independent read and write cursors.
///
/// Layout is a single contiguous region:
///
/// ```text
/// [ consumed | readable | back-writable ]
///   ^read_idx  ^write_idx               ^capacity
/// ```
///
/// Writes first reclaim the consumed prefix by compaction, then grow the
/// backing storage. Cursors only move forward between compactions, so slices
/// handed out by [`readable_slice`](Self::readable_slice) stay valid until
/// the next write.
pub struct Buffer {
    storage: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self { storage: vec![0; DEFAULT_CAPACITY], read_idx: 0, write_idx: 0 }
    }

    /// Bytes available to read.
    #[inline]
    pub fn readable(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// Free space after the write cursor.
    #[inline]
    pub fn back_writable(&self) -> usize {
        self.storage.len() - self.write_idx
    }

    /// Reclaimable space before the read cursor.
    #[inline]
    pub fn front_writable(&self) -> usize {
        self.read_idx
    }

    /// The readable region.
    #[inline]
    pub fn readable_slice(&self) -> &[u8] {
        &self.storage[self.read_idx..self.write_idx]
    }

    /// The back-writable region; pair with
    /// [`advance_write`](Self::advance_write) after filling a prefix.
    #[inline]
    pub fn writable_slice(&mut self) -> &mut [u8] {
        let start = self.write_idx;
        &mut self.storage[start..]
    }

    /// Appends `src`, compacting or growing as needed.
    pub fn write(&mut self, src: &[u8]) {
        self.ensure_space(src.len());
        self.storage[self.write_idx..self.write_idx + src.len()].copy_from_slice(src);
        self.write_idx += src.len();
    }

    /// Copies the next `dst.len()` readable bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) {
        assert!(dst.len() <= self.readable(), "peek past readable region");
        dst.copy_from_slice(&self.storage[self.read_idx..self.read_idx + dst.len()]);
    }

    /// Copies the next `dst.len()` readable bytes and consumes them.
    pub fn read(&mut self, dst: &mut [u8]) {
        self.peek(dst);
        self.advance_read(dst.len());
    }

    /// Consumes `n` readable bytes without copying.
    pub fn advance_read(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        assert!(n <= self.readable(), "read cursor past write cursor");
        self.read_idx += n;
    }

    /// Marks `n` bytes after the write cursor as written.
    pub fn advance_write(&mut self, n: usize) {
        assert!(n <= self.back_writable(), "write cursor past capacity");
        self.write_idx += n;
    }

    /// Consumes and returns one line including its terminator.
    ///
    /// CRLF-terminated lines win over bare-LF lines; with neither present
    /// the buffer is untouched and `None` is returned.
    pub fn read_line(&mut self) -> Option<Vec<u8>> {
        let region = self.readable_slice();
        let end = match region.windows(2).position(|w| w == b"\r\n") {
            Some(p) => p + 2,
            None => region.iter().position(|&b| b == b'\n')? + 1,
        };
        let line = region[..end].to_vec();
        self.advance_read(end);
        Some(line)
    }

    /// Resets both cursors; storage is kept.
    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }

    /// Makes room for `n` more bytes after the write cursor.
    ///
    /// Order of preference: the back gap as-is, compaction into the consumed
    /// prefix, then growing the storage to `write_idx + n`.
    fn ensure_space(&mut self, n: usize) {
        if n <= self.back_writable() {
            return;
        }
        if n <= self.back_writable() + self.front_writable() {
            let readable = self.readable();
            self.storage.copy_within(self.read_idx..self.write_idx, 0);
            self.read_idx = 0;
            self.write_idx = readable;
        } else {
            self.storage.resize(self.write_idx + n, 0);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut buf = Buffer::new();
        let src = b"the quick brown fox";
        buf.write(src);
        let mut dst = vec![0u8; src.len()];
        buf.read(&mut dst);
        assert_eq!(dst, src);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn line_scan_prefers_crlf_then_lf() {
        let mut buf = Buffer::new();
        buf.write(b"Line 1\r\nLine 2\n");
        assert_eq!(buf.read_line().unwrap(), b"Line 1\r\n");
        assert_eq!(buf.read_line().unwrap(), b"Line 2\n");
        assert_eq!(buf.readable(), 0);
        assert!(buf.read_line().is_none());
    }

    #[test]
    fn partial_line_is_left_in_place() {
        let mut buf = Buffer::new();
        buf.write(b"no terminator yet");
        assert!(buf.read_line().is_none());
        assert_eq!(buf.readable(), 17);
    }

    #[test]
    fn compaction_then_growth() {
        let mut buf = Buffer::new();
        buf.write(&[1u8; 10]);
        let mut dst = [0u8; 5];
        buf.read(&mut dst);
        // 5 readable + 1024 incoming: back (1014) + front (5) is short, so the
        // storage grows to exactly write_idx + n.
        buf.write(&[2u8; 1024]);
        assert_eq!(buf.readable(), 1029);
        assert_eq!(buf.storage.len(), 1034);

        // A following small write fits in the compacted layout without growth.
        let mut drain = vec![0u8; 1000];
        buf.read(&mut drain);
        buf.write(&[3u8; 500]);
        assert_eq!(buf.storage.len(), 1034);
    }

    #[test]
    fn compaction_moves_readable_to_front() {
        let mut buf = Buffer::new();
        buf.write(&[7u8; 1000]);
        buf.advance_read(900);
        // back = 24, front = 900: 100 more bytes compact instead of growing.
        buf.write(&[8u8; 100]);
        assert_eq!(buf.read_idx, 0);
        assert_eq!(buf.readable(), 200);
        assert_eq!(buf.storage.len(), DEFAULT_CAPACITY);
    }

    #[test]
    #[should_panic(expected = "read cursor past write cursor")]
    fn overread_is_fatal() {
        let mut buf = Buffer::new();
        buf.write(b"ab");
        buf.advance_read(3);
    }

    #[test]
    fn manual_fill_through_writable_slice() {
        let mut buf = Buffer::new();
        buf.writable_slice()[..3].copy_from_slice(b"abc");
        buf.advance_write(3);
        assert_eq!(buf.readable_slice(), b"abc");
    }

    #[test]
    fn clear_resets_cursors() {
        let mut buf = Buffer::new();
        buf.write(b"data");
        buf.clear();
        assert_eq!(buf.readable(), 0);
        assert_eq!(buf.front_writable(), 0);
    }
}
