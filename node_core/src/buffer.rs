//! A dynamically sized, double-ended, chunk-backed FIFO byte queue. Data is appended at the
//! head and read from the tail; chunks that are fully drained are returned to a pool instead of
//! being freed, so steady-state operation does not allocate.
//!
//! This is the buffering primitive every peer channel and RPC connection in the crate uses for
//! both its inbound and outbound side - see [`crate::peer::channel::PeerChannel`] and
//! [`crate::master::client::MasterCallClient`].

use crate::chunk::Chunk;
use crate::chunkpool::ChunkPool;
use std::collections::VecDeque;
use std::io;

pub struct ByteBuffer {
    chunks: VecDeque<Chunk>,
    pool: ChunkPool,
    len: usize,
}

impl ByteBuffer {
    #[inline]
    pub fn new() -> ByteBuffer {
        let mut chunks = VecDeque::new();
        chunks.push_back(Chunk::new());
        ByteBuffer {
            chunks,
            pool: ChunkPool::new(),
            len: 0,
        }
    }

    /// Bytes currently buffered and not yet consumed.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes to the buffer, growing it with pooled chunks as needed. Never blocks.
    pub fn push_bytes(&mut self, mut data: &[u8]) {
        self.len += data.len();

        while !data.is_empty() {
            let chunk = self.chunks.back_mut().expect("buffer always has a tail chunk");
            let room = chunk.capacity();

            if room == 0 {
                self.chunks.push_back(self.pool.alloc());
                continue;
            }

            let take = room.min(data.len());
            chunk.writeable_slice()[..take].copy_from_slice(&data[..take]);
            chunk.expand(take);
            data = &data[take..];
        }
    }

    /// Copy out the first `count` bytes without consuming them. Used by framed-protocol parsers
    /// that need to inspect buffered data before they know how much of it to `take`.
    pub fn peek(&self, count: usize) -> Vec<u8> {
        assert!(count <= self.len, "not enough buffered data to peek");

        let mut out = Vec::with_capacity(count);
        let mut remaining = count;

        for chunk in &self.chunks {
            if remaining == 0 {
                break;
            }
            let available = chunk.remaining_data();
            let take = remaining.min(available);
            out.extend_from_slice(&chunk.readable_slice()[..take]);
            remaining -= take;
        }

        out
    }

    /// Remove and return exactly `count` bytes from the front of the buffer. Panics if fewer
    /// than `count` bytes are buffered - callers must check [`ByteBuffer::len`] first, which is
    /// how every framed-protocol state machine in this crate uses it.
    pub fn take(&mut self, count: usize) -> Vec<u8> {
        assert!(count <= self.len, "not enough buffered data to take");

        let mut out = Vec::with_capacity(count);
        let mut remaining = count;

        while remaining > 0 {
            let chunk = self.chunks.front_mut().expect("buffer underflow despite len check");
            let take = remaining.min(chunk.remaining_data());
            out.extend_from_slice(&chunk.readable_slice()[..take]);
            chunk.advance(take);
            remaining -= take;

            if chunk.remaining_data() == 0 && self.chunks.len() > 1 {
                let drained = self.chunks.pop_front().unwrap();
                self.pool.reclaim(drained);
            }
        }

        self.len -= count;
        out
    }

    /// Read the data from `reader` into the buffer until it would block or errors. Returns the
    /// number of bytes actually read.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total_count = 0usize;

        loop {
            match self.read_once(&mut reader) {
                Ok(read_count) => {
                    total_count += read_count;
                    self.chunks.push_back(self.pool.alloc());
                }
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        self.len += total_count;
                        return Ok(total_count);
                    } else {
                        self.len += total_count;
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Write buffered data to `writer` until it would block, errors, or the buffer is drained.
    /// Returns the number of bytes actually written.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total_count = 0usize;

        loop {
            if self.len == 0 {
                return Ok(total_count);
            }

            match self.write_once(&mut writer) {
                Ok(write_count) => {
                    total_count += write_count;
                    self.len -= write_count;

                    if self.chunks.len() > 1 && self.chunks.front().unwrap().remaining_data() == 0 {
                        self.pool.reclaim(self.chunks.pop_front().unwrap());
                    }

                    if self.len == 0 {
                        return Ok(total_count);
                    }
                }
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        return Ok(total_count);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
    }

    #[inline]
    fn write_once<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let chunk = self.chunks.front_mut().unwrap();
        let write_count = writer.write(chunk.readable_slice())?;

        if write_count == 0 && chunk.remaining_data() > 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        chunk.advance(write_count);
        Ok(write_count)
    }

    #[inline]
    fn read_once<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let chunk = self.chunks.back_mut().unwrap();

        if chunk.capacity() == 0 {
            return Ok(0);
        }

        let read_count = reader.read(chunk.writeable_slice())?;

        if read_count == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        chunk.expand(read_count);
        Ok(read_count)
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        ByteBuffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CHUNK_SIZE;
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

            let offset = min(self.chunk, min(buf.len(), self.data.len() - self.cursor));
            buf[0..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
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
            self.data.extend(&buf[0..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn roundtrip_across_many_chunks() {
        let mock_data: Vec<_> = (0..(CHUNK_SIZE * 3)).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = ByteBuffer::new();
        buffer.ingress(&mut channel).unwrap();
        assert_eq!(buffer.len(), mock_data.len());

        channel.clear();
        buffer.egress(&mut channel).unwrap();

        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn push_and_take_exact() {
        let mut buffer = ByteBuffer::new();
        buffer.push_bytes(&[1, 2, 3, 4, 5]);
        assert_eq!(buffer.len(), 5);

        let first = buffer.take(2);
        assert_eq!(first, vec![1, 2]);
        assert_eq!(buffer.len(), 3);

        let rest = buffer.take(3);
        assert_eq!(rest, vec![3, 4, 5]);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn push_spanning_multiple_chunks_preserves_order() {
        let mut buffer = ByteBuffer::new();
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        buffer.push_bytes(&data);
        assert_eq!(buffer.len(), data.len());

        let taken = buffer.take(data.len());
        assert_eq!(taken, data);
    }

    #[test]
    #[should_panic(expected = "not enough buffered data")]
    fn take_past_len_panics() {
        let mut buffer = ByteBuffer::new();
        buffer.push_bytes(&[1, 2]);
        buffer.take(3);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut buffer = ByteBuffer::new();
        buffer.push_bytes(&[1, 2, 3, 4, 5]);
        assert_eq!(buffer.peek(3), vec![1, 2, 3]);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.take(5), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn no_err_on_empty_cursor() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buffer = ByteBuffer::new();
        buffer.ingress(&mut cursor).unwrap();
        assert_eq!(buffer.len(), 3);

        let mut sink = Cursor::new(Vec::<u8>::new());
        buffer.egress(&mut sink).unwrap();
        assert_eq!(&sink.get_ref()[..], &vec![1, 2, 3][..]);
    }
}
