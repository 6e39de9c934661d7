use futures::prelude::*;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Buffer for a fixed number of bytes to be read.
///
/// The buffer is filled from an [AsyncRead] with [ReadBuffer::poll_read].
/// Once the expected number of bytes has arrived the data is returned and
/// the buffer resets. A zero-size buffer completes immediately.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Vec<u8>,
    read_count: usize,
}

impl ReadBuffer {
    pub fn new(size: usize) -> Self {
        ReadBuffer {
            data: vec![0u8; size],
            read_count: 0,
        }
    }

    pub fn poll_read(
        &mut self,
        mut reader: Pin<&mut impl AsyncRead>,
        cx: &mut Context,
    ) -> Poll<io::Result<Vec<u8>>> {
        loop {
            if self.read_count == self.data.len() {
                return Poll::Ready(Ok(self.finish()));
            }
            let buf = &mut self.data[self.read_count..];
            let read_count_current = futures::ready!(reader.as_mut().poll_read(cx, buf))?;
            if read_count_current == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }
            self.read_count += read_count_current;
        }
    }

    /// True while no bytes of the current chunk have arrived yet.
    pub fn is_empty(&self) -> bool {
        self.read_count == 0
    }

    fn finish(&mut self) -> Vec<u8> {
        self.read_count = 0;
        std::mem::replace(&mut self.data, Vec::new())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn reads_exactly_the_requested_size() {
        let data = (0u8..32).collect::<Vec<_>>();
        let mut reader = futures::io::Cursor::new(data.clone());
        let mut buffer = ReadBuffer::new(20);

        let chunk = futures::future::poll_fn(|cx| buffer.poll_read(Pin::new(&mut reader), cx))
            .await
            .unwrap();
        assert_eq!(chunk, &data[..20]);
        assert!(buffer.is_empty());
    }

    #[async_std::test]
    async fn eof_mid_chunk_is_an_error() {
        let mut reader = futures::io::Cursor::new(vec![1u8, 2, 3]);
        let mut buffer = ReadBuffer::new(8);

        let result =
            futures::future::poll_fn(|cx| buffer.poll_read(Pin::new(&mut reader), cx)).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[async_std::test]
    async fn zero_size_completes_immediately() {
        let mut reader = futures::io::Cursor::new(Vec::<u8>::new());
        let mut buffer = ReadBuffer::new(0);

        let chunk = futures::future::poll_fn(|cx| buffer.poll_read(Pin::new(&mut reader), cx))
            .await
            .unwrap();
        assert!(chunk.is_empty());
    }
}
