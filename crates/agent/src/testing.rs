//! Scripted test doubles shared across this crate's unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::llm::LlmClient;

pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    repeated: Option<String>,
    fail: bool,
}

impl ScriptedLlm {
    /// Plays back the given replies in order, then fails.
    pub fn with_replies(replies: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(str::to_string).collect()),
            repeated: None,
            fail: false,
        }
    }

    /// Returns the same reply forever.
    pub fn repeating(reply: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            repeated: Some(reply.to_string()),
            fail: false,
        }
    }

    /// Fails every call, simulating a classifier outage.
    pub fn failing() -> Self {
        Self { replies: Mutex::new(VecDeque::new()), repeated: None, fail: true }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
        if self.fail {
            return Err(anyhow!("scripted outage"));
        }
        if let Some(reply) = self.replies.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
            return Ok(reply);
        }
        self.repeated.clone().ok_or_else(|| anyhow!("script exhausted"))
    }
}
