//! HV relay box with PT100 channels.
//!
//! Line protocol, one command per line:
//!
//! ```text
//! *IDN?            -> identification
//! SYST:UPT?        -> seconds since power-up
//! SYST:MEM?        -> free memory in bytes
//! TEMP?            -> comma separated temperatures, channel 1 first
//! REL:CH <n> ON|OFF
//! REL:CH? <n>      -> ON|OFF
//! REL:ALL ON|OFF
//! REL:ALL?         -> comma separated 1|0, channel 1 first
//! ```

use super::{on_off, parse_bool, parse_f64_list, parse_u64, RelayBox};
use crate::error::DaqResult;
use crate::resource::ResourceGuard;
use async_trait::async_trait;

/// Relay box bound to an acquired resource.
pub struct SwitchBox {
    resource: ResourceGuard,
}

impl SwitchBox {
    /// Driver over a claimed relay box resource.
    pub fn new(resource: ResourceGuard) -> Self {
        Self { resource }
    }
}

#[async_trait]
impl RelayBox for SwitchBox {
    async fn identify(&self) -> DaqResult<String> {
        self.resource.query("*IDN?").await
    }

    async fn uptime(&self) -> DaqResult<u64> {
        let reply = self.resource.query("SYST:UPT?").await?;
        parse_u64("SYST:UPT?", &reply)
    }

    async fn memory(&self) -> DaqResult<u64> {
        let reply = self.resource.query("SYST:MEM?").await?;
        parse_u64("SYST:MEM?", &reply)
    }

    async fn temperatures(&self) -> DaqResult<Vec<f64>> {
        let reply = self.resource.query("TEMP?").await?;
        parse_f64_list("TEMP?", &reply)
    }

    async fn set_relay(&self, channel: u8, on: bool) -> DaqResult<()> {
        self.resource
            .write(&format!("REL:CH {} {}", channel, on_off(on)))
            .await
    }

    async fn relay(&self, channel: u8) -> DaqResult<bool> {
        let command = format!("REL:CH? {}", channel);
        let reply = self.resource.query(&command).await?;
        parse_bool(&command, &reply)
    }

    async fn set_all_relays(&self, on: bool) -> DaqResult<()> {
        self.resource.write(&format!("REL:ALL {}", on_off(on))).await
    }

    async fn relays(&self) -> DaqResult<Vec<bool>> {
        let reply = self.resource.query("REL:ALL?").await?;
        reply
            .split(',')
            .map(|value| parse_bool("REL:ALL?", value))
            .collect()
    }
}
