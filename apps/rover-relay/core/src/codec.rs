use std::{io, time::Duration};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::command::ProtocolError;

#[derive(Debug, Error)]
pub enum ReadLineError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Newline-delimited reader with a hard bound on line length.
///
/// `next_line` is cancel safe: bytes read before the future is dropped stay
/// buffered and are picked up by the next call, so it can sit inside
/// `tokio::time::timeout` or `select!` without losing input.
pub struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
    max_line: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            pending: Vec::new(),
            max_line: max_line.max(1),
        }
    }

    /// Returns the next line without its terminator, or `None` at end of
    /// stream. A final unterminated line is still returned.
    pub async fn next_line(&mut self) -> Result<Option<String>, ReadLineError> {
        loop {
            if self.pending.last() == Some(&b'\n') {
                return Ok(Some(self.take_pending()));
            }
            if self.pending.len() > self.max_line {
                self.pending.clear();
                return Err(ProtocolError::LineTooLong {
                    limit: self.max_line,
                }
                .into());
            }

            let budget = (self.max_line + 1 - self.pending.len()) as u64;
            let read = (&mut self.inner)
                .take(budget)
                .read_until(b'\n', &mut self.pending)
                .await?;
            if read == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_pending()));
            }
        }
    }

    fn take_pending(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        while matches!(bytes.last(), Some(b'\n' | b'\r')) {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Writes `line` followed by a newline and flushes, failing with
/// `TimedOut` if the peer does not drain it within `deadline`.
pub async fn write_line<W>(writer: &mut W, line: &str, deadline: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut frame = Vec::with_capacity(line.len() + 1);
    frame.extend_from_slice(line.as_bytes());
    frame.push(b'\n');

    let write = async {
        writer.write_all(&frame).await?;
        writer.flush().await
    };
    match tokio::time::timeout(deadline, write).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("write did not complete within {deadline:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test_timeout::tokio_timeout_test]
    async fn reads_lines_and_trailing_fragment() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(b"HELLO_CONTROLLER\r\nF\n\nS").await.unwrap();
        drop(tx);

        let mut reader = LineReader::new(rx, 64);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("HELLO_CONTROLLER"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("F"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("S"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn oversized_line_is_rejected() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(b"ABCDEFGHIJ\n").await.unwrap();
        drop(tx);

        let mut reader = LineReader::new(rx, 4);
        let err = reader.next_line().await.expect_err("line too long");
        assert!(matches!(
            err,
            ReadLineError::Protocol(ProtocolError::LineTooLong { limit: 4 })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn line_at_limit_is_accepted() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(b"ABCD\n").await.unwrap();
        drop(tx);

        let mut reader = LineReader::new(rx, 4);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("ABCD"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn partial_line_survives_cancelled_read() {
        let (mut tx, rx) = duplex(64);
        let mut reader = LineReader::new(rx, 64);

        tx.write_all(b"HEL").await.unwrap();
        let first = tokio::time::timeout(Duration::from_millis(50), reader.next_line()).await;
        assert!(first.is_err(), "no full line available yet");

        tx.write_all(b"LO_NODEMCU\n").await.unwrap();
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("HELLO_NODEMCU"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn write_line_times_out_on_stalled_peer() {
        let (mut tx, _rx) = duplex(1);
        let err = write_line(&mut tx, "F", Duration::from_millis(50))
            .await
            .expect_err("peer never reads");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
