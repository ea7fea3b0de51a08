//! Dump-file records. Each message is stored as its frame count followed by
//! `(size, bytes)` for every frame. Counts and sizes are written as
//! native-endian `usize`, so dump files are only portable between hosts of
//! the same word size and byte order.

use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::Result;

const WORD: usize = std::mem::size_of::<usize>();
/// Frame sizes come from the file; buffers beyond this grow as data arrives.
const MAX_PREALLOCATION: usize = 1024 * 1024;

#[derive(Debug)]
pub struct DumpWriter<W: Write> {
    inner: W,
    messages: u64,
}

impl<W: Write> DumpWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, messages: 0 }
    }

    pub fn write_message(&mut self, frames: &[Bytes]) -> Result<()> {
        self.inner.write_all(&frames.len().to_ne_bytes())?;
        for frame in frames {
            self.inner.write_all(&frame.len().to_ne_bytes())?;
            self.inner.write_all(frame)?;
        }
        self.messages += 1;
        Ok(())
    }

    pub fn messages_written(&self) -> u64 {
        self.messages
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[derive(Debug)]
pub struct DumpReader<R: Read> {
    inner: R,
}

impl<R: Read> DumpReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next message, or `None` at a clean end of file. A record cut short
    /// anywhere after its frame count is an `UnexpectedEof` error.
    pub fn next_message(&mut self) -> Result<Option<Vec<Bytes>>> {
        let Some(count) = self.read_word_or_eof()? else {
            return Ok(None);
        };
        let mut frames = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            let size = self.read_word()?;
            let mut frame = Vec::with_capacity(size.min(MAX_PREALLOCATION));
            (&mut self.inner).take(size as u64).read_to_end(&mut frame)?;
            if frame.len() != size {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            frames.push(Bytes::from(frame));
        }
        Ok(Some(frames))
    }

    fn read_word(&mut self) -> Result<usize> {
        let mut buf = [0u8; WORD];
        self.inner.read_exact(&mut buf)?;
        Ok(usize::from_ne_bytes(buf))
    }

    fn read_word_or_eof(&mut self) -> Result<Option<usize>> {
        let mut buf = [0u8; WORD];
        let mut filled = 0;
        while filled < WORD {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(usize::from_ne_bytes(buf)))
    }
}

impl<R: Read> Iterator for DumpReader<R> {
    type Item = Result<Vec<Bytes>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_message().transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::Error;
    use crate::wire::{CompressionMethod, Meta, WireMessage};

    fn frames(key: &'static str) -> Vec<Bytes> {
        WireMessage::new(
            "shop-production",
            key,
            Bytes::from_static(br#"{"page":"orders#show"}"#),
            Meta::new(CompressionMethod::None, 3, 42, 1_700_000_000_000),
        )
        .into_frames()
    }

    #[test]
    fn messages_read_back_in_order() {
        let mut writer = DumpWriter::new(Vec::new());
        writer.write_message(&frames("logs.shop.production")).unwrap();
        writer.write_message(&frames("js_exceptions.shop.production")).unwrap();
        assert_eq!(writer.messages_written(), 2);

        let reader = DumpReader::new(Cursor::new(writer.into_inner()));
        let read: Vec<Vec<Bytes>> = reader.collect::<Result<_>>().unwrap();
        assert_eq!(read, vec![frames("logs.shop.production"), frames("js_exceptions.shop.production")]);

        let msg = WireMessage::from_frames(read[1].clone()).unwrap();
        assert_eq!(msg.meta.sequence_number, 42);
    }

    #[test]
    fn record_layout_uses_native_words() {
        let mut writer = DumpWriter::new(Vec::new());
        writer
            .write_message(&[Bytes::from_static(b"ab"), Bytes::new()])
            .unwrap();
        let raw = writer.into_inner();

        let mut expected = Vec::new();
        expected.extend_from_slice(&2usize.to_ne_bytes());
        expected.extend_from_slice(&2usize.to_ne_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&0usize.to_ne_bytes());
        assert_eq!(raw, expected);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut writer = DumpWriter::new(Vec::new());
        writer.write_message(&frames("logs.shop.production")).unwrap();
        let mut raw = writer.into_inner();
        raw.truncate(raw.len() - 5);

        let mut reader = DumpReader::new(Cursor::new(raw));
        match reader.next_message() {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected eof error, got {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_length_is_an_error() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1usize.to_ne_bytes());
        raw.extend_from_slice(&(usize::MAX / 2).to_ne_bytes());
        raw.extend_from_slice(b"short");

        let mut reader = DumpReader::new(Cursor::new(raw));
        match reader.next_message() {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected eof error, got {other:?}"),
        }
    }

    #[test]
    fn empty_input_has_no_messages() {
        let mut reader = DumpReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(reader.next_message().unwrap().is_none());
    }
}
