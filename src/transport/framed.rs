//! Length-prefixed framing over byte streams.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes.
//! [FrameReader] turns an [AsyncRead] into a [Stream] of frames,
//! [FrameWriter] turns an [AsyncWrite] into a [Sink] for frames.

use bytes::{Buf as _, Bytes};
use futures::prelude::*;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::NetworkError;
use crate::utils::ReadBuffer;

/// Frames larger than this are refused on both ends.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX_SIZE: usize = 4;

#[pin_project::pin_project]
pub struct FrameReader<Reader> {
    #[pin]
    reader: Reader,
    state: ReadState,
}

enum ReadState {
    Closed,
    ReadingLen { buffer: ReadBuffer },
    ReadingBody { buffer: ReadBuffer },
}

impl ReadState {
    fn init() -> Self {
        ReadState::ReadingLen {
            buffer: ReadBuffer::new(LEN_PREFIX_SIZE),
        }
    }
}

impl<Reader> FrameReader<Reader> {
    pub fn new(reader: Reader) -> Self {
        FrameReader {
            reader,
            state: ReadState::init(),
        }
    }
}

impl<Reader> std::fmt::Debug for FrameReader<Reader> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader").finish()
    }
}

impl<Reader: AsyncRead> Stream for FrameReader<Reader> {
    type Item = Result<Vec<u8>, NetworkError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let result = futures::ready!(self.as_mut().poll_next_inner(cx));
        match result {
            Some(Err(_)) | None => *self.project().state = ReadState::Closed,
            _ => (),
        }
        Poll::Ready(result)
    }
}

impl<Reader: AsyncRead> FrameReader<Reader> {
    fn poll_next_inner(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<Result<Vec<u8>, NetworkError>>> {
        loop {
            let mut this = self.as_mut().project();
            match &mut this.state {
                ReadState::Closed => return Poll::Ready(None),
                ReadState::ReadingLen { buffer } => {
                    let fresh = buffer.is_empty();
                    let prefix = match futures::ready!(buffer.poll_read(this.reader, cx)) {
                        Ok(prefix) => prefix,
                        // A clean close between frames ends the stream.
                        Err(error) if fresh && error.kind() == io::ErrorKind::UnexpectedEof => {
                            return Poll::Ready(None);
                        }
                        Err(error) => return Poll::Ready(Some(Err(NetworkError::Recv(error)))),
                    };
                    let mut prefix = Bytes::from(prefix);
                    let size = prefix.get_u32() as usize;
                    if size > MAX_FRAME_SIZE {
                        return Poll::Ready(Some(Err(NetworkError::FrameTooLarge {
                            size,
                            limit: MAX_FRAME_SIZE,
                        })));
                    }
                    *this.state = ReadState::ReadingBody {
                        buffer: ReadBuffer::new(size),
                    };
                }
                ReadState::ReadingBody { buffer } => {
                    let body = futures::ready!(buffer.poll_read(this.reader, cx))
                        .map_err(NetworkError::Recv)?;
                    *this.state = ReadState::init();
                    return Poll::Ready(Some(Ok(body)));
                }
            }
        }
    }
}

#[pin_project::pin_project]
pub struct FrameWriter<Writer> {
    #[pin]
    writer: Writer,
    buffer: Bytes,
}

impl<Writer> std::fmt::Debug for FrameWriter<Writer> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl<Writer: AsyncWrite> FrameWriter<Writer> {
    pub fn new(writer: Writer) -> Self {
        FrameWriter {
            writer,
            buffer: Bytes::new(),
        }
    }

    fn poll_flush_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), NetworkError>> {
        let mut this = self.project();
        loop {
            if this.buffer.is_empty() {
                return Poll::Ready(Ok(()));
            }
            let written = futures::ready!(this.writer.as_mut().poll_write(cx, &*this.buffer))
                .map_err(NetworkError::Send)?;
            this.buffer.advance(written);
        }
    }
}

impl<Writer: AsyncWrite> Sink<Vec<u8>> for FrameWriter<Writer> {
    type Error = NetworkError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        futures::ready!(self.poll_flush_buffer(cx))?;
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, frame: Vec<u8>) -> Result<(), Self::Error> {
        debug_assert!(self.buffer.is_empty());
        if frame.len() > MAX_FRAME_SIZE {
            return Err(NetworkError::FrameTooLarge {
                size: frame.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        let this = self.project();
        let mut framed = Vec::with_capacity(LEN_PREFIX_SIZE + frame.len());
        framed.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        framed.extend_from_slice(&frame);
        *this.buffer = Bytes::from(framed);
        Ok(())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        futures::ready!(self.as_mut().poll_flush_buffer(cx))?;
        futures::ready!(self.project().writer.poll_flush(cx)).map_err(NetworkError::Send)?;
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        futures::ready!(self.as_mut().poll_flush_buffer(cx))?;
        futures::ready!(self.project().writer.poll_close(cx)).map_err(NetworkError::Send)?;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn writer_reader_roundtrip() {
        let frames = vec![b"first".to_vec(), Vec::new(), b"third frame".to_vec()];

        let mut encoded = Vec::new();
        {
            let mut writer = FrameWriter::new(futures::io::Cursor::new(&mut encoded));
            for frame in &frames {
                writer.send(frame.clone()).await.unwrap();
            }
            writer.close().await.unwrap();
        }

        let reader = FrameReader::new(futures::io::Cursor::new(encoded));
        let decoded = reader.try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(decoded, frames);
    }

    #[async_std::test]
    async fn reader_ends_cleanly_between_frames() {
        let mut encoded = Vec::new();
        {
            let mut writer = FrameWriter::new(futures::io::Cursor::new(&mut encoded));
            writer.send(b"only".to_vec()).await.unwrap();
        }

        let mut reader = FrameReader::new(futures::io::Cursor::new(encoded));
        assert_eq!(reader.try_next().await.unwrap(), Some(b"only".to_vec()));
        assert_eq!(reader.try_next().await.unwrap(), None);
    }

    #[async_std::test]
    async fn truncated_frame_is_an_error() {
        let mut encoded = Vec::new();
        {
            let mut writer = FrameWriter::new(futures::io::Cursor::new(&mut encoded));
            writer.send(b"truncated".to_vec()).await.unwrap();
        }
        encoded.truncate(encoded.len() - 2);

        let mut reader = FrameReader::new(futures::io::Cursor::new(encoded));
        let result = reader.try_next().await;
        assert!(matches!(result, Err(NetworkError::Recv(_))));
    }

    #[async_std::test]
    async fn oversized_frame_is_refused() {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

        let mut reader = FrameReader::new(futures::io::Cursor::new(encoded));
        let result = reader.try_next().await;
        assert!(matches!(result, Err(NetworkError::FrameTooLarge { .. })));
    }
}
