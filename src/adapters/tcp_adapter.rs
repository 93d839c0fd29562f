//! TCP Hardware Adapter for LAN instruments
//!
//! Provides an [`Adapter`] over a raw socket connection, as exposed by LXI
//! instruments (port 5025) and serial-to-ethernet bridges used for GPIB and
//! RS-232 devices.

use super::{reply_delimiter, Adapter};
use crate::error::{DaqError, DaqResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Socket adapter with per-transaction timeout.
pub struct TcpAdapter {
    /// Resource name used in error messages
    name: String,
    /// Buffered socket
    stream: BufReader<TcpStream>,
    /// Read/write timeout
    timeout: Duration,
    /// Line terminator appended to commands
    termination: String,
    /// Byte that ends a reply
    delimiter: u8,
}

impl TcpAdapter {
    /// Open a connection to `host` (`address:port`).
    pub async fn connect(
        name: &str,
        host: &str,
        io_timeout: Duration,
        termination: &str,
    ) -> DaqResult<Self> {
        let stream = timeout(io_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| DaqError::connection(name, format!("connect to {} timed out", host)))?
            .map_err(|err| DaqError::connection(name, format!("connect to {}: {}", host, err)))?;
        stream
            .set_nodelay(true)
            .map_err(|err| DaqError::connection(name, err))?;
        debug!(resource = name, host, "TCP connection opened");
        Ok(Self {
            name: name.to_string(),
            stream: BufReader::new(stream),
            timeout: io_timeout,
            termination: termination.to_string(),
            delimiter: reply_delimiter(termination),
        })
    }

    async fn send(&mut self, command: &str) -> DaqResult<()> {
        let line = format!("{}{}", command, self.termination);
        timeout(self.timeout, self.stream.get_mut().write_all(line.as_bytes()))
            .await
            .map_err(|_| DaqError::connection(&self.name, format!("write timed out: {}", command)))?
            .map_err(|err| DaqError::connection(&self.name, err))?;
        debug!(resource = %self.name, command, "sent");
        Ok(())
    }
}

#[async_trait]
impl Adapter for TcpAdapter {
    async fn write(&mut self, command: &str) -> DaqResult<()> {
        self.send(command).await
    }

    async fn query(&mut self, command: &str) -> DaqResult<String> {
        self.send(command).await?;
        let mut reply = Vec::new();
        let read = timeout(self.timeout, self.stream.read_until(self.delimiter, &mut reply))
            .await
            .map_err(|_| DaqError::connection(&self.name, format!("read timed out: {}", command)))?
            .map_err(|err| DaqError::connection(&self.name, err))?;
        if read == 0 {
            return Err(DaqError::connection(&self.name, "connection closed by peer"));
        }
        let reply = String::from_utf8_lossy(&reply).trim().to_string();
        debug!(resource = %self.name, command, reply = %reply, "received");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_query_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*IDN?\r\n");
            socket.write_all(b"KEITHLEY,MODEL 2410,1,C32\r\n").await.unwrap();
        });

        let mut adapter = TcpAdapter::connect("smu", &addr, Duration::from_secs(1), "\r\n")
            .await
            .unwrap();
        let reply = adapter.query("*IDN?").await.unwrap();
        assert_eq!(reply, "KEITHLEY,MODEL 2410,1,C32");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_ends_at_carriage_return() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"AI0?\r");
            socket.write_all(b"23.4\r").await.unwrap();
            // Keep the socket open so only the delimiter can end the reply.
            let _ = done_rx.await;
        });

        let mut adapter = TcpAdapter::connect("chamber", &addr, Duration::from_secs(1), "\r")
            .await
            .unwrap();
        assert_eq!(adapter.query("AI0?").await.unwrap(), "23.4");
        done_tx.send(()).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = TcpAdapter::connect("dmm", &addr, Duration::from_millis(500), "\n").await;
        assert!(matches!(result, Err(DaqError::Connection { .. })));
    }
}
