//! A growable byte queue: data is appended at the tail and consumed from
//! the head. Shaped after `neutronium::net::buffer::Buffer`'s
//! `ingress`/`egress` contract, backed by `bytes::BytesMut` instead of a
//! `slice_deque` ring so it compiles on stable without unsafe mmap tricks.

use bytes::{Buf, BytesMut};
use std::io;

const DEFAULT_CAPACITY: usize = 64 * 1024;

pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Slice containing the unconsumed data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drop the first `count` bytes, as if they had been consumed.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        self.data.advance(count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Read all available data off the given reader into the buffer, up to
    /// one short-read / `WouldBlock`. Returns the number of bytes read.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;
        let base = self.data.len();

        loop {
            self.data.resize(base + total + DEFAULT_CAPACITY, 0);
            let dst = &mut self.data[base + total..];

            match reader.read(dst) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if total > 0 && err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.data.truncate(base + total);
                    return Err(err);
                }
            }
        }

        self.data.truncate(base + total);
        Ok(total)
    }

    /// Write the buffered contents out to the given writer, advancing the
    /// read offset as bytes are accepted. Returns the number of bytes
    /// written before the writer signalled `WouldBlock` or the buffer
    /// drained.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while !self.data.is_empty() {
            let written = match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            };

            self.data.advance(written);
        }

        Ok(orig_len - self.data.len())
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..self.cursor + offset]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn roundtrip_through_a_mock_channel() {
        let mock_data: Vec<_> = (0..1000).map(|i| i as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 97, mock_data.len());

        let mut buffer = Buffer::new();
        let read = buffer.ingress(&mut channel).unwrap();
        assert_eq!(read, mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let written = buffer.egress(&mut channel).unwrap();
        assert_eq!(written, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data, mock_data);
    }

    #[test]
    fn egress_errors_on_zero_write() {
        let mut buffer = Buffer::new();
        buffer.extend_from_slice(&[1]);

        let mut sink = &mut [][..];
        let result = buffer.egress(&mut sink);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn ingress_stops_on_would_block_after_partial_read() {
        let mock_data = vec![1u8, 2, 3];
        let mut channel = MockChannel::new(mock_data.clone(), 2, mock_data.len());

        let mut buffer = Buffer::new();
        let read = buffer.ingress(&mut channel).unwrap();

        assert_eq!(read, mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);
    }

    #[test]
    fn ingress_and_egress_via_cursor() {
        let mut buffer = Buffer::new();
        buffer.ingress(&mut Cursor::new(vec![1, 2, 3])).unwrap();
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);

        let mut out = Vec::new();
        buffer.egress(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(buffer.len(), 0);
    }
}
