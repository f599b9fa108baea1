use crate::dap::framing::{encode_message, FrameDecoder};
use crate::dap::transport_trait::{DapReader, DapWriter};
use crate::dap::types::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tracing::trace;

const READ_CHUNK: usize = 8 * 1024;

/// Frame-decoding reader over any byte stream (adapter stdout or TCP).
pub struct FramedReader<R> {
    inner: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> DapReader for FramedReader<R> {
    async fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(result) = self.decoder.next_message() {
                return result;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::Dap("Connection closed".to_string()));
            }
            trace!("DAP: read {} bytes", n);
            self.decoder.push(&chunk[..n]);
        }
    }
}

/// Frame-encoding writer over any byte sink (adapter stdin or TCP).
pub struct FramedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> DapWriter for FramedWriter<W> {
    async fn write_message(&mut self, msg: &Message) -> Result<()> {
        let frame = encode_message(msg)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Split a spawned adapter's stdio into DAP halves.
pub fn from_stdio(
    stdin: ChildStdin,
    stdout: ChildStdout,
) -> (Box<dyn DapReader>, Box<dyn DapWriter>) {
    (
        Box::new(FramedReader::new(stdout)),
        Box::new(FramedWriter::new(stdin)),
    )
}

/// Split a connected TCP socket into DAP halves.
pub fn from_socket(socket: TcpStream) -> (Box<dyn DapReader>, Box<dyn DapWriter>) {
    let (read_half, write_half) = socket.into_split();
    (
        Box::new(FramedReader::new(read_half)),
        Box::new(FramedWriter::new(write_half)),
    )
}
