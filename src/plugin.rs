//! Mackerel agent plugin adapter
//!
//! Turns a scan into the two gauges the agent collects (`usage` and `size`)
//! and writes them in the agent's plugin text protocol. Graph definitions
//! are emitted instead when the agent asks for metadata.

use crate::config::PluginConfig;
use crate::limiter::CancellationToken;
use crate::utils;
use crate::walker;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Environment variable the agent sets when it wants graph definitions
pub const PLUGIN_META_ENV: &str = "MACKEREL_AGENT_PLUGIN_META";

const DEFINITIONS_HEADER: &str = "# mackerel-agent-plugin";

/// One collection cycle's values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Bytes consumed on disk, in whole megabytes
    pub usage: u64,
    /// Configured capacity
    pub size: u64,
}

impl CacheMetrics {
    pub fn get(&self, name: &str) -> Option<u64> {
        match name {
            "usage" => Some(self.usage),
            "size" => Some(self.size),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDef {
    pub name: String,
    pub label: String,
    pub stacked: bool,
    /// Raw gauge when false; the agent protocol never carries this field
    #[serde(skip)]
    pub diff: bool,
    #[serde(skip)]
    pub kind: &'static str,
}

impl MetricDef {
    fn gauge(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            stacked: false,
            diff: false,
            kind: "uint64",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphDef {
    pub label: String,
    pub unit: String,
    pub metrics: Vec<MetricDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphDefinitions {
    pub graphs: BTreeMap<String, GraphDef>,
}

/// Values persisted to the scratch file between invocations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastValues {
    pub usage: u64,
    pub size: u64,
    #[serde(rename = "_lastTime", with = "chrono::serde::ts_seconds")]
    pub last_time: DateTime<Utc>,
}

impl LastValues {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self).context("Failed to serialize last values")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write scratch file {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scratch file {}", path.display()))?;
        let values = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse scratch file {}", path.display()))?;
        Ok(values)
    }
}

/// nginx `proxy_cache_path` usage plugin
#[derive(Debug, Clone)]
pub struct NginxCachePlugin {
    config: PluginConfig,
}

impl NginxCachePlugin {
    pub fn new(config: PluginConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn graph_key(&self) -> String {
        format!("nginx-cache.disk-{}", self.config.zone_name)
    }

    pub fn graph_definition(&self) -> GraphDefinitions {
        let graph = GraphDef {
            label: format!("nginx cache usage megabyte: {}", self.config.cache_path.display()),
            unit: "integer".to_string(),
            metrics: vec![MetricDef::gauge("usage", "Usage"), MetricDef::gauge("size", "Size")],
        };

        let mut graphs = BTreeMap::new();
        graphs.insert(self.graph_key(), graph);
        GraphDefinitions { graphs }
    }

    /// Scan the cache and build this cycle's values.
    ///
    /// Any scan failure is returned as an error; no partial usage escapes.
    pub fn fetch_metrics(&self, cancel: &CancellationToken) -> Result<CacheMetrics> {
        let request = self.config.scan_request();
        let mut limiter = request.build_limiter().context("Invalid stat limiter settings")?;

        let summary = walker::scan(&request, &mut limiter, cancel)
            .with_context(|| format!("Failed to scan {}", request.root.display()))?;

        info!(
            "{}: {} used of {} configured",
            self.config.zone_name,
            utils::format_size(summary.usage),
            self.config.capacity
        );

        Ok(CacheMetrics {
            usage: summary.usage_megabytes(),
            size: self.config.capacity,
        })
    }

    pub fn output_definitions<W: Write>(&self, out: &mut W) -> Result<()> {
        let json = serde_json::to_string(&self.graph_definition())
            .context("Failed to serialize graph definitions")?;
        writeln!(out, "{}", DEFINITIONS_HEADER)?;
        writeln!(out, "{}", json)?;
        Ok(())
    }

    /// Print `<key>.<metric>\t<value>\t<epoch>` lines and record them in the scratch file
    pub fn output_values<W: Write>(
        &self,
        out: &mut W,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let metrics = self.fetch_metrics(cancel)?;

        for (key, graph) in &self.graph_definition().graphs {
            for metric in &graph.metrics {
                match metrics.get(&metric.name) {
                    Some(value) => writeln!(out, "{}.{}\t{}\t{}", key, metric.name, value, now.timestamp())?,
                    None => debug!("No value for {}.{}", key, metric.name),
                }
            }
        }

        self.record(metrics, now);
        Ok(())
    }

    /// Values were already emitted, so scratch file problems only warn
    fn record(&self, metrics: CacheMetrics, now: DateTime<Utc>) {
        let tempfile = &self.config.tempfile;

        if let Ok(last) = LastValues::load(tempfile) {
            debug!(
                "Usage {} MB at {} -> {} MB now",
                last.usage,
                last.last_time.to_rfc3339(),
                metrics.usage
            );
        }

        let current = LastValues {
            usage: metrics.usage,
            size: metrics.size,
            last_time: now,
        };
        if let Err(e) = current.save(tempfile) {
            warn!("{:#}", e);
        }
    }
}

/// True when the agent requested graph definitions instead of values
pub fn wants_definitions() -> bool {
    is_meta_request(std::env::var_os(PLUGIN_META_ENV).as_deref())
}

/// Definitions mode is selected by any non-empty value
fn is_meta_request(value: Option<&OsStr>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}
