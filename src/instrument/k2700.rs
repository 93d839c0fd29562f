//! Keithley 2700 multimeter with a 7700 style scanner card.
//!
//! Each scan is one internal trigger over the channel list; the number of
//! samples equals the number of channels, so `:FETC?` returns one voltage per
//! channel in list order.

use super::{on_off, parse_bool, parse_error_entry, parse_f64, parse_f64_list, Multimeter, TriggerDelay};
use crate::config::{FilterConfig, FilterType};
use crate::error::{DaqError, DaqResult};
use crate::resource::ResourceGuard;
use async_trait::async_trait;

/// Keithley 2700 bound to an acquired resource.
pub struct K2700 {
    resource: ResourceGuard,
}

impl K2700 {
    /// Driver over a claimed multimeter resource.
    pub fn new(resource: ResourceGuard) -> Self {
        Self { resource }
    }
}

/// Format a channel list as `(@101,102)`.
pub fn format_channel_list(channels: &[u32]) -> String {
    let list: Vec<String> = channels.iter().map(u32::to_string).collect();
    format!("(@{})", list.join(","))
}

/// Parse a channel list reply, expanding ranges like `(@101:103)`.
pub fn parse_channel_list(command: &str, reply: &str) -> DaqResult<Vec<u32>> {
    let parse_error = || DaqError::Parse {
        command: command.to_string(),
        reply: reply.to_string(),
    };
    let inner = reply
        .trim()
        .strip_prefix("(@")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(parse_error)?;

    let mut channels = Vec::new();
    for item in inner.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        match item.split_once(':') {
            Some((first, last)) => {
                let first: u32 = first.parse().map_err(|_| parse_error())?;
                let last: u32 = last.parse().map_err(|_| parse_error())?;
                channels.extend(first..=last);
            }
            None => channels.push(item.parse().map_err(|_| parse_error())?),
        }
    }
    Ok(channels)
}

#[async_trait]
impl Multimeter for K2700 {
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

    async fn configure_scan(&self, channels: &[u32]) -> DaqResult<()> {
        if channels.is_empty() {
            return self.resource.write(":ROUT:SCAN:LSEL NONE").await;
        }
        self.resource.write(":FORM:ELEM READ").await?;
        self.resource
            .write(&format!(":ROUT:SCAN {}", format_channel_list(channels)))
            .await?;
        self.resource
            .write(&format!(":SAMP:COUN {}", channels.len()))
            .await?;
        self.resource.write(":TRIG:COUN 1").await?;
        self.resource.write(":ROUT:SCAN:TSO IMM").await?;
        self.resource.write(":ROUT:SCAN:LSEL INT").await
    }

    async fn scan_channels(&self) -> DaqResult<Vec<u32>> {
        let reply = self.resource.query(":ROUT:SCAN?").await?;
        parse_channel_list(":ROUT:SCAN?", &reply)
    }

    async fn set_filter(&self, filter: &FilterConfig) -> DaqResult<()> {
        let control = match filter.filter_type {
            FilterType::Repeat => "REP",
            FilterType::Moving => "MOV",
        };
        self.resource
            .write(&format!(":SENS:VOLT:AVER:TCON {}", control))
            .await?;
        self.resource
            .write(&format!(":SENS:VOLT:AVER:COUN {}", filter.count))
            .await?;
        self.resource
            .write(&format!(":SENS:VOLT:AVER:STAT {}", on_off(filter.enable)))
            .await
    }

    async fn filter(&self) -> DaqResult<FilterConfig> {
        let reply = self.resource.query(":SENS:VOLT:AVER:STAT?").await?;
        let enable = parse_bool(":SENS:VOLT:AVER:STAT?", &reply)?;
        let reply = self.resource.query(":SENS:VOLT:AVER:TCON?").await?;
        let filter_type = match reply.trim() {
            "REP" | "REPEAT" => FilterType::Repeat,
            "MOV" | "MOVING" => FilterType::Moving,
            _ => {
                return Err(DaqError::Parse {
                    command: ":SENS:VOLT:AVER:TCON?".into(),
                    reply,
                })
            }
        };
        let reply = self.resource.query(":SENS:VOLT:AVER:COUN?").await?;
        let count = parse_f64(":SENS:VOLT:AVER:COUN?", &reply)?;
        Ok(FilterConfig {
            enable,
            filter_type,
            count: count.round() as u32,
        })
    }

    async fn set_trigger_delay(&self, delay: TriggerDelay) -> DaqResult<()> {
        match delay {
            TriggerDelay::Auto => self.resource.write(":TRIG:DEL:AUTO ON").await,
            TriggerDelay::Fixed(seconds) => {
                self.resource.write(":TRIG:DEL:AUTO OFF").await?;
                self.resource
                    .write(&format!(":TRIG:DEL {:E}", seconds))
                    .await
            }
        }
    }

    async fn trigger_delay(&self) -> DaqResult<TriggerDelay> {
        let reply = self.resource.query(":TRIG:DEL:AUTO?").await?;
        if parse_bool(":TRIG:DEL:AUTO?", &reply)? {
            return Ok(TriggerDelay::Auto);
        }
        let reply = self.resource.query(":TRIG:DEL?").await?;
        Ok(TriggerDelay::Fixed(parse_f64(":TRIG:DEL?", &reply)?))
    }

    async fn initiate(&self) -> DaqResult<()> {
        self.resource.write(":INIT").await
    }

    async fn fetch(&self) -> DaqResult<Vec<f64>> {
        let reply = self.resource.query(":FETC?").await?;
        parse_f64_list(":FETC?", &reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    #[test]
    fn test_channel_list_format() {
        assert_eq!(format_channel_list(&[101, 102, 110]), "(@101,102,110)");
        assert_eq!(
            parse_channel_list(":ROUT:SCAN?", "(@101,103:105)").unwrap(),
            vec![101, 103, 104, 105]
        );
        assert!(parse_channel_list(":ROUT:SCAN?", "(@)").unwrap().is_empty());
        assert!(parse_channel_list(":ROUT:SCAN?", "101,102").is_err());
    }

    #[tokio::test]
    async fn test_configure_scan_commands() {
        let mock = MockAdapter::new();
        let dmm = K2700::new(ResourceGuard::detached("dmm", Box::new(mock.clone())));
        dmm.configure_scan(&[101, 104]).await.unwrap();
        let commands = mock.commands();
        assert!(commands.contains(&":ROUT:SCAN (@101,104)".to_string()));
        assert!(commands.contains(&":SAMP:COUN 2".to_string()));
        assert_eq!(commands.last().map(String::as_str), Some(":ROUT:SCAN:LSEL INT"));
    }

    #[tokio::test]
    async fn test_fixed_trigger_delay() {
        let mock = MockAdapter::new();
        mock.always(":TRIG:DEL:AUTO?", "0").always(":TRIG:DEL?", "+5.000000E-02");
        let dmm = K2700::new(ResourceGuard::detached("dmm", Box::new(mock.clone())));
        assert_eq!(dmm.trigger_delay().await.unwrap(), TriggerDelay::Fixed(0.05));
    }
}
