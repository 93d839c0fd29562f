//! Serial adapter for RS-232 communication
//!
//! This adapter wraps the serialport crate and provides async I/O using
//! Tokio's blocking task executor for the synchronous port operations.

use super::{reply_delimiter, Adapter};
use crate::error::{DaqError, DaqResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Serial adapter with line terminated replies.
pub struct SerialAdapter {
    /// Resource name used in error messages
    name: String,
    /// Port handle, moved into blocking tasks
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    /// Total reply timeout
    timeout: Duration,
    /// Line terminator appended to commands
    termination: String,
    /// Byte that ends a reply
    delimiter: u8,
}

impl SerialAdapter {
    /// Open `port_name` at `baud_rate`.
    pub async fn open(
        name: &str,
        port_name: &str,
        baud_rate: u32,
        timeout: Duration,
        termination: &str,
    ) -> DaqResult<Self> {
        let owned_port = port_name.to_string();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&owned_port, baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
        })
        .await
        .map_err(|err| DaqError::connection(name, format!("serial open task failed: {}", err)))?
        .map_err(|err| DaqError::connection(name, format!("open {}: {}", port_name, err)))?;

        debug!(resource = name, port = port_name, baud_rate, "serial port opened");
        Ok(Self {
            name: name.to_string(),
            port: Arc::new(Mutex::new(port)),
            timeout,
            termination: termination.to_string(),
            delimiter: reply_delimiter(termination),
        })
    }

    async fn transact(&mut self, command: &str, expect_reply: bool) -> DaqResult<String> {
        let port = self.port.clone();
        let name = self.name.clone();
        let line = format!("{}{}", command, self.termination);
        let timeout = self.timeout;
        let delimiter = self.delimiter;

        tokio::task::spawn_blocking(move || -> DaqResult<String> {
            let mut port = port.lock();
            port.write_all(line.as_bytes())
                .map_err(|err| DaqError::connection(&name, err))?;
            if !expect_reply {
                return Ok(String::new());
            }

            let start = Instant::now();
            let mut reply: Vec<u8> = Vec::new();
            let mut buffer = [0u8; 64];
            while !reply.contains(&delimiter) {
                if start.elapsed() > timeout {
                    return Err(DaqError::connection(
                        &name,
                        format!("serial read timeout after {:?}", timeout),
                    ));
                }
                match port.read(&mut buffer) {
                    Ok(0) => continue,
                    Ok(n) => reply.extend_from_slice(&buffer[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(err) => return Err(DaqError::connection(&name, err)),
                }
            }
            Ok(String::from_utf8_lossy(&reply).trim().to_string())
        })
        .await
        .map_err(|err| DaqError::connection(&self.name, format!("serial I/O task failed: {}", err)))?
    }
}

#[async_trait]
impl Adapter for SerialAdapter {
    async fn write(&mut self, command: &str) -> DaqResult<()> {
        self.transact(command, false).await?;
        debug!(resource = %self.name, command, "sent");
        Ok(())
    }

    async fn query(&mut self, command: &str) -> DaqResult<String> {
        let reply = self.transact(command, true).await?;
        debug!(resource = %self.name, command, reply = %reply, "received");
        Ok(reply)
    }
}
