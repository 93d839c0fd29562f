//! Scripted adapter for driver tests
//!
//! [`MockAdapter`] answers queries from preset replies and records every
//! command, so driver tests can check the exact command sequence.

use super::Adapter;
use crate::error::{DaqError, DaqResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<String>>,
    fixed: HashMap<String, String>,
    log: Vec<String>,
}

/// Adapter answering queries from a script and recording every command.
///
/// Clones share the same script, so a test can keep one handle and give the
/// other to a driver.
#[derive(Clone, Default)]
pub struct MockAdapter {
    script: Arc<Mutex<Script>>,
}

impl MockAdapter {
    /// Empty script; every query fails until a reply is set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot reply for `command`. Queued replies win over fixed ones.
    pub fn reply(&self, command: &str, reply: &str) -> &Self {
        self.script
            .lock()
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
        self
    }

    /// Reply to every `command` with `reply`.
    pub fn always(&self, command: &str, reply: &str) -> &Self {
        self.script
            .lock()
            .fixed
            .insert(command.to_string(), reply.to_string());
        self
    }

    /// Every command seen so far, writes and queries.
    pub fn commands(&self) -> Vec<String> {
        self.script.lock().log.clone()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn write(&mut self, command: &str) -> DaqResult<()> {
        self.script.lock().log.push(command.to_string());
        Ok(())
    }

    async fn query(&mut self, command: &str) -> DaqResult<String> {
        let mut script = self.script.lock();
        script.log.push(command.to_string());
        if let Some(reply) = script.queued.get_mut(command).and_then(VecDeque::pop_front) {
            return Ok(reply);
        }
        script
            .fixed
            .get(command)
            .cloned()
            .ok_or_else(|| DaqError::instrument("mock", format!("no scripted reply for {}", command)))
    }
}
