//! Keithley 2410 source-measure unit driver
//!
//! SCPI over the resource transport. The unit sources voltage and measures
//! current; `:FORM:ELEM CURR` reduces `:READ?` replies to a single value.

use super::{on_off, parse_error_entry, parse_f64, SourceMeter};
use crate::config::{FilterConfig, FilterType, Terminals};
use crate::error::{DaqError, DaqResult};
use crate::resource::ResourceGuard;
use async_trait::async_trait;

/// Keithley 2410 bound to an acquired resource.
pub struct K2410 {
    resource: ResourceGuard,
}

impl K2410 {
    /// Driver over a claimed SMU resource.
    pub fn new(resource: ResourceGuard) -> Self {
        Self { resource }
    }

    async fn query_f64(&self, command: &str) -> DaqResult<f64> {
        let reply = self.resource.query(command).await?;
        parse_f64(command, &reply)
    }

    async fn query_bool(&self, command: &str) -> DaqResult<bool> {
        let reply = self.resource.query(command).await?;
        super::parse_bool(command, &reply)
    }
}

#[async_trait]
impl SourceMeter for K2410 {
    async fn identify(&self) -> DaqResult<String> {
        self.resource.query("*IDN?").await
    }

    async fn reset(&self) -> DaqResult<()> {
        self.resource.write("*RST").await
    }

    async fn clear(&self) -> DaqResult<()> {
        self.resource.write("*CLS").await
    }

    async fn set_beeper(&self, enabled: bool) -> DaqResult<()> {
        self.resource
            .write(&format!(":SYST:BEEP:STAT {}", on_off(enabled)))
            .await
    }

    async fn next_error(&self) -> DaqResult<Option<String>> {
        let reply = self.resource.query(":SYST:ERR?").await?;
        parse_error_entry(":SYST:ERR?", &reply)
    }

    async fn set_terminals(&self, terminals: Terminals) -> DaqResult<()> {
        let value = match terminals {
            Terminals::Front => "FRON",
            Terminals::Rear => "REAR",
        };
        self.resource.write(&format!(":ROUT:TERM {}", value)).await
    }

    async fn terminals(&self) -> DaqResult<Terminals> {
        let reply = self.resource.query(":ROUT:TERM?").await?;
        match reply.trim() {
            "FRON" | "FRONT" => Ok(Terminals::Front),
            "REAR" => Ok(Terminals::Rear),
            _ => Err(DaqError::Parse {
                command: ":ROUT:TERM?".into(),
                reply,
            }),
        }
    }

    async fn configure_source_voltage(&self) -> DaqResult<()> {
        self.resource.write(":SOUR:FUNC VOLT").await?;
        self.resource.write(":SOUR:VOLT:MODE FIX").await?;
        self.resource.write(":SENS:FUNC 'CURR'").await?;
        self.resource.write(":SENS:CURR:RANG:AUTO ON").await?;
        self.resource.write(":FORM:ELEM CURR").await
    }

    async fn set_filter(&self, filter: &FilterConfig) -> DaqResult<()> {
        let control = match filter.filter_type {
            FilterType::Repeat => "REP",
            FilterType::Moving => "MOV",
        };
        self.resource
            .write(&format!(":SENS:AVER:TCON {}", control))
            .await?;
        self.resource
            .write(&format!(":SENS:AVER:COUN {}", filter.count))
            .await?;
        self.resource
            .write(&format!(":SENS:AVER:STAT {}", on_off(filter.enable)))
            .await
    }

    async fn filter(&self) -> DaqResult<FilterConfig> {
        let enable = self.query_bool(":SENS:AVER:STAT?").await?;
        let reply = self.resource.query(":SENS:AVER:TCON?").await?;
        let filter_type = match reply.trim() {
            "REP" | "REPEAT" => FilterType::Repeat,
            "MOV" | "MOVING" => FilterType::Moving,
            _ => {
                return Err(DaqError::Parse {
                    command: ":SENS:AVER:TCON?".into(),
                    reply,
                })
            }
        };
        let count = self.query_f64(":SENS:AVER:COUN?").await?;
        Ok(FilterConfig {
            enable,
            filter_type,
            count: count.round() as u32,
        })
    }

    async fn set_compliance(&self, limit: f64) -> DaqResult<()> {
        self.resource
            .write(&format!(":SENS:CURR:PROT:LEV {:E}", limit))
            .await
    }

    async fn compliance(&self) -> DaqResult<f64> {
        self.query_f64(":SENS:CURR:PROT:LEV?").await
    }

    async fn compliance_tripped(&self) -> DaqResult<bool> {
        self.query_bool(":SENS:CURR:PROT:TRIP?").await
    }

    async fn set_voltage(&self, voltage: f64) -> DaqResult<()> {
        self.resource
            .write(&format!(":SOUR:VOLT:LEV {:E}", voltage))
            .await
    }

    async fn voltage(&self) -> DaqResult<f64> {
        self.query_f64(":SOUR:VOLT:LEV?").await
    }

    async fn set_output(&self, enabled: bool) -> DaqResult<()> {
        self.resource
            .write(&format!(":OUTP:STAT {}", on_off(enabled)))
            .await
    }

    async fn output(&self) -> DaqResult<bool> {
        self.query_bool(":OUTP:STAT?").await
    }

    async fn read_current(&self) -> DaqResult<f64> {
        self.query_f64(":READ?").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    fn driver() -> (K2410, MockAdapter) {
        let mock = MockAdapter::new();
        let guard = ResourceGuard::detached("smu", Box::new(mock.clone()));
        (K2410::new(guard), mock)
    }

    #[tokio::test]
    async fn test_set_voltage_command() {
        let (smu, mock) = driver();
        smu.set_voltage(-800.0).await.unwrap();
        smu.set_compliance(80e-6).await.unwrap();
        assert_eq!(
            mock.commands(),
            vec![":SOUR:VOLT:LEV -8E2", ":SENS:CURR:PROT:LEV 8E-5"]
        );
    }

    #[tokio::test]
    async fn test_filter_read_back() {
        let (smu, mock) = driver();
        mock.always(":SENS:AVER:STAT?", "1")
            .always(":SENS:AVER:TCON?", "MOV")
            .always(":SENS:AVER:COUN?", "+20");
        let filter = smu.filter().await.unwrap();
        assert_eq!(
            filter,
            FilterConfig {
                enable: true,
                filter_type: FilterType::Moving,
                count: 20
            }
        );
    }

    #[tokio::test]
    async fn test_tripped_and_current() {
        let (smu, mock) = driver();
        mock.always(":SENS:CURR:PROT:TRIP?", "0")
            .always(":READ?", "-1.234E-07");
        assert!(!smu.compliance_tripped().await.unwrap());
        assert_eq!(smu.read_current().await.unwrap(), -1.234e-7);
    }

    #[tokio::test]
    async fn test_error_queue() {
        let (smu, mock) = driver();
        mock.reply(":SYST:ERR?", "-222,\"Data out of range\"")
            .always(":SYST:ERR?", "0,\"No error\"");
        assert!(smu.next_error().await.unwrap().is_some());
        assert!(smu.next_error().await.unwrap().is_none());
    }
}
