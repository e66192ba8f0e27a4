use std::io::{self, IoSliceMut, Read, Write};

const INITIAL_SIZE: usize = 1024;
const SPILL_SIZE: usize = 65536;

/// Growable byte region with split read/write cursors.
///
/// The region `[read_idx, write_idx)` is readable, `[write_idx, capacity)` is
/// writable and `[0, read_idx)` has been consumed and can be reclaimed. All
/// operations preserve the order of readable bytes. The buffer has a single
/// owner and is never shared across threads.
pub struct Buffer {
    data: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0; capacity],
            read_idx: 0,
            write_idx: 0,
        }
    }

    /// The number of unread bytes.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// Free space past the write cursor.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_idx
    }

    /// Space in front of the read cursor, reclaimable by compaction.
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_idx
    }

    /// View of the readable region. Invalidated by any mutation.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_idx..self.write_idx]
    }

    /// Advances the read cursor by `len`. Consuming everything resets both
    /// cursors to the start of the region.
    #[inline]
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_idx += len;
        } else {
            self.retrieve_all();
        }
    }

    #[inline]
    pub fn retrieve_all(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }

    /// Copies all readable bytes out and resets the cursors.
    #[inline]
    pub fn retrieve_all_to_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    /// Lossy string form of `retrieve_all_to_bytes`.
    #[inline]
    pub fn retrieve_all_to_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_to_bytes()).into_owned()
    }

    /// Appends `data` after the write cursor, growing the region as needed.
    #[inline]
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
        self.write_idx += data.len();
    }

    /// Guarantees at least `len` writable bytes: compacts the consumed prefix
    /// away when that suffices, otherwise grows the region.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() < len {
            self.data.resize(self.write_idx + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_idx..self.write_idx, 0);
            self.read_idx = 0;
            self.write_idx = readable;
        }
    }

    /// Reads from `reader` with a single scatter call into the writable region
    /// plus a stack-local spill buffer, so one readiness notification costs
    /// one syscall even when the buffer is near-full. The spill tail is
    /// appended afterwards.
    ///
    /// OS errors are propagated verbatim; callers classify `WouldBlock` and
    /// `Interrupted` as retryable.
    pub fn read_from<R: Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut spill = [0u8; SPILL_SIZE];
        let writable = self.writable_bytes();

        let (_, tail) = self.data.split_at_mut(self.write_idx);
        let mut bufs = [IoSliceMut::new(tail), IoSliceMut::new(&mut spill)];
        let count = reader.read_vectored(&mut bufs)?;

        if count <= writable {
            self.write_idx += count;
        } else {
            self.write_idx = self.data.len();
            self.append(&spill[..count - writable]);
        }
        Ok(count)
    }

    /// Writes the readable region to `writer` with a single call and advances
    /// the read cursor by the amount written.
    pub fn write_to<W: Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let count = writer.write(self.peek())?;
        self.retrieve(count);
        Ok(count)
    }
}

impl Default for Buffer {
    #[inline]
    fn default() -> Buffer {
        Buffer::new()
    }
}
