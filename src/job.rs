//! Command jobs: run one external command per item with bounded concurrency.
//!
//! A job is loaded from TOML:
//!
//! ```toml
//! [job]
//! command = ["convert", "{}", "{}.png"]
//! max_concurrency = 4
//! items = ["a.svg", "b.svg"]
//! ```
//!
//! `{}` in an argument expands to the item and `{#}` to its position. The
//! child also gets `FANOUT_ITEM` and `FANOUT_INDEX` in its environment.

use crate::engine::{concurrency_bound, for_each_indexed};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct JobFile {
    job: Job,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub command: Vec<String>,
    #[serde(default = "default_bound")]
    pub max_concurrency: i64,
    #[serde(default)]
    pub items: Vec<String>,
}

fn default_bound() -> i64 {
    1
}

impl Job {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            max_concurrency: default_bound(),
            items: Vec::new(),
        }
    }

    pub fn items(mut self, items: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.items = items.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: i64) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Parse a job from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let file: JobFile =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad job file: {e}")))?;
        file.job.validate()?;
        Ok(file.job)
    }

    /// Load a job from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read job file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    fn validate(&self) -> Result<usize> {
        if self.command.is_empty() {
            return Err(Error::Config("job command must not be empty".to_string()));
        }
        concurrency_bound(self.max_concurrency)
    }

    /// Run the command once per item. Fails if any invocation fails.
    pub async fn run(&self) -> Result<()> {
        let bound = self.validate()?;
        let command: Arc<[String]> = self.command.iter().cloned().collect();

        info!(
            program = %command[0],
            items = self.items.len(),
            max_concurrency = bound,
            "job starting"
        );

        for_each_indexed(
            self.items.clone(),
            move |item, index| run_item(Arc::clone(&command), item, index),
            bound,
        )
        .await
    }
}

/// Substitute `{}` with the item and `{#}` with its position.
fn expand(arg: &str, item: &str, index: usize) -> String {
    arg.replace("{#}", &index.to_string()).replace("{}", item)
}

async fn run_item(command: Arc<[String]>, item: String, index: usize) -> Result<()> {
    let mut args = command.iter().map(|arg| expand(arg, &item, index));
    let program = args
        .next()
        .ok_or_else(|| Error::Config("job command must not be empty".to_string()))?;

    debug!(index, item = %item, program = %program, "running command");

    let status = Command::new(&program)
        .args(args)
        .env("FANOUT_ITEM", &item)
        .env("FANOUT_INDEX", index.to_string())
        .stdin(Stdio::null())
        .status()
        .await?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::Other(format!(
            "{program} exited with status {} for item {index} ({item})",
            status.code().unwrap_or(-1)
        )))
    }
}
