//! Hardware adapter implementations
//!
//! This module contains implementations of the [`Adapter`] trait, providing
//! line-oriented command/query I/O for the transports the instruments are
//! attached to:
//!
//! - [`TcpAdapter`]: LAN instruments and serial-to-ethernet bridges
//! - [`SerialAdapter`]: RS-232 devices (feature `instrument_serial`)
//! - [`MockAdapter`]: scripted replies for driver tests
//!
//! [`HardwareConnector`] opens the right adapter from a configured address.

pub mod mock_adapter;
#[cfg(feature = "instrument_serial")]
pub mod serial_adapter;
pub mod tcp_adapter;

pub use mock_adapter::MockAdapter;
#[cfg(feature = "instrument_serial")]
pub use serial_adapter::SerialAdapter;
pub use tcp_adapter::TcpAdapter;

use crate::config::ResourceConfig;
use crate::error::{DaqError, DaqResult};
use crate::resource::Connector;
use async_trait::async_trait;

/// Line-oriented command transport to a single device.
///
/// Commands are passed without line terminator; adapters append and strip
/// terminators themselves.
#[async_trait]
pub trait Adapter: Send {
    /// Send a command without reading a reply.
    async fn write(&mut self, command: &str) -> DaqResult<()>;

    /// Send a command and read one reply line (trimmed).
    async fn query(&mut self, command: &str) -> DaqResult<String>;
}

/// Byte that ends a reply: the last byte of the configured terminator, or
/// `\n` when none is configured.
pub fn reply_delimiter(termination: &str) -> u8 {
    termination.as_bytes().last().copied().unwrap_or(b'\n')
}

/// Parsed form of a resource address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `tcp://host:port`
    Tcp(String),
    /// `serial:///dev/ttyUSB0?baud=9600`
    Serial { port: String, baud_rate: u32 },
}

impl Address {
    /// Parse a configured address string.
    pub fn parse(address: &str) -> DaqResult<Self> {
        if let Some(rest) = address.strip_prefix("tcp://") {
            if rest.is_empty() || !rest.contains(':') {
                return Err(DaqError::Configuration(format!(
                    "TCP address '{}' must be tcp://host:port",
                    address
                )));
            }
            return Ok(Address::Tcp(rest.to_string()));
        }
        if let Some(rest) = address.strip_prefix("serial://") {
            let (port, query) = rest.split_once('?').unwrap_or((rest, ""));
            if port.is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Serial address '{}' has no port",
                    address
                )));
            }
            let mut baud_rate = 9600;
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some(("baud", value)) => {
                        baud_rate = value.parse().map_err(|_| {
                            DaqError::Configuration(format!(
                                "Invalid baud rate '{}' in '{}'",
                                value, address
                            ))
                        })?;
                    }
                    _ => {
                        return Err(DaqError::Configuration(format!(
                            "Unknown serial option '{}' in '{}'",
                            pair, address
                        )))
                    }
                }
            }
            return Ok(Address::Serial {
                port: port.to_string(),
                baud_rate,
            });
        }
        Err(DaqError::Configuration(format!(
            "Unsupported resource address '{}'",
            address
        )))
    }
}

/// Opens real transports based on the address scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareConnector;

#[async_trait]
impl Connector for HardwareConnector {
    async fn connect(&self, name: &str, config: &ResourceConfig) -> DaqResult<Box<dyn Adapter>> {
        match Address::parse(&config.address)? {
            Address::Tcp(host) => {
                let adapter = TcpAdapter::connect(name, &host, config.timeout(), &config.termination)
                    .await?;
                Ok(Box::new(adapter))
            }
            #[cfg(feature = "instrument_serial")]
            Address::Serial { port, baud_rate } => {
                let adapter =
                    SerialAdapter::open(name, &port, baud_rate, config.timeout(), &config.termination)
                        .await?;
                Ok(Box::new(adapter))
            }
            #[cfg(not(feature = "instrument_serial"))]
            Address::Serial { .. } => Err(DaqError::Configuration(format!(
                "Resource '{}' needs serial support. Rebuild with --features instrument_serial",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            Address::parse("tcp://192.168.0.10:10002").ok(),
            Some(Address::Tcp("192.168.0.10:10002".into()))
        );
        assert!(Address::parse("tcp://localhost").is_err());
    }

    #[test]
    fn test_parse_serial_with_baud() {
        assert_eq!(
            Address::parse("serial:///dev/ttyUSB0?baud=19200").ok(),
            Some(Address::Serial {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 19200
            })
        );
        assert_eq!(
            Address::parse("serial://COM3").ok(),
            Some(Address::Serial {
                port: "COM3".into(),
                baud_rate: 9600
            })
        );
    }

    #[test]
    fn test_reply_delimiter_follows_termination() {
        assert_eq!(reply_delimiter("\r\n"), b'\n');
        assert_eq!(reply_delimiter("\r"), b'\r');
        assert_eq!(reply_delimiter(""), b'\n');
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(Address::parse("GPIB0::16::INSTR").is_err());
        assert!(Address::parse("serial:///dev/ttyS0?parity=odd").is_err());
    }
}
