use anyhow::Context;
use chrono::Utc;
use clap::{ArgAction, Parser};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::{self, PluginConfig};
use crate::error::ConfigError;
use crate::limiter::{CancellationToken, DEFAULT_STAT_BURST, DEFAULT_STAT_RATE};
use crate::plugin::{self, NginxCachePlugin};
use crate::utils::BlockMetric;
use crate::walker::{DepthLimit, DEFAULT_MAX_DEPTH};

#[derive(Parser, Debug, Clone)]
#[command(name = "mackerel-plugin-nginx-cache")]
#[command(version)]
#[command(about = "Report nginx proxy_cache disk usage to mackerel-agent")]
#[command(long_about = "Walks an nginx proxy_cache directory with a rate-limited stat budget \
    and prints its usage alongside the configured max_size.\n\n\
    Examples:\n  \
    mackerel-plugin-nginx-cache --path /var/cache/nginx --size 500m --kname static\n  \
    MACKEREL_AGENT_PLUGIN_META=1 mackerel-plugin-nginx-cache --path /var/cache/nginx --size 500m --kname static")]
pub struct Cli {
    /// proxy_cache_path $path
    #[arg(long, value_name = "DIR")]
    pub path: Option<PathBuf>,

    /// proxy_cache_path $max_size (e.g. 500m)
    #[arg(long, value_name = "SIZE")]
    pub size: Option<String>,

    /// proxy_cache_path $keys_zone name
    #[arg(long, value_name = "NAME")]
    pub kname: Option<String>,

    /// Temporary file path [default: derived from --path]
    #[arg(long, value_name = "FILE")]
    pub tempfile: Option<PathBuf>,

    /// Maximum stat calls per second
    #[arg(long, default_value_t = DEFAULT_STAT_RATE, value_name = "PER_SEC")]
    pub stat_rate: f64,

    /// Stat calls allowed in a burst
    #[arg(long, default_value_t = DEFAULT_STAT_BURST, value_name = "COUNT")]
    pub stat_burst: u32,

    /// Depth bound for the walk (advisory unless --enforce-depth)
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH, value_name = "DEPTH")]
    pub max_depth: usize,

    /// Skip directories deeper than --max-depth
    #[arg(long)]
    pub enforce_depth: bool,

    /// Metadata field counted per file
    #[arg(long, value_enum, default_value_t = BlockMetric::Allocated)]
    pub block_metric: BlockMetric,

    /// Abort the scan after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Increase log verbosity on stderr (-v, -vv for more)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all logging except errors
    #[arg(short = 'q', long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Cli {
    /// Default log filter for the requested verbosity
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            "mackerel_plugin_nginx_cache=error"
        } else {
            match self.verbose {
                0 => "mackerel_plugin_nginx_cache=warn",
                1 => "mackerel_plugin_nginx_cache=info,warn",
                _ => "mackerel_plugin_nginx_cache=debug,warn",
            }
        }
    }

    pub fn to_config(&self) -> anyhow::Result<PluginConfig> {
        let path = self.path.clone().ok_or(ConfigError::MissingPath)?;
        let capacity = config::parse_capacity(self.size.as_deref().unwrap_or_default())?;

        let mut cfg = PluginConfig::new(path, capacity, self.kname.clone().unwrap_or_default());
        if let Some(tempfile) = &self.tempfile {
            cfg.tempfile = tempfile.clone();
        }
        cfg.stat_rate = self.stat_rate;
        cfg.stat_burst = self.stat_burst;
        cfg.depth_limit = DepthLimit {
            max_depth: self.max_depth,
            enforce: self.enforce_depth,
        };
        cfg.block_metric = self.block_metric;
        cfg.timeout = self.timeout.map(Duration::from_secs);

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn run(self) -> anyhow::Result<()> {
        let config = self.to_config().context("Invalid configuration")?;
        let plugin = NginxCachePlugin::new(config);

        let stdout = io::stdout();
        let mut out = stdout.lock();

        if plugin::wants_definitions() {
            plugin.output_definitions(&mut out)?;
        } else {
            let cancel = CancellationToken::new();
            if let Some(timeout) = plugin.config().timeout {
                spawn_deadline(timeout, cancel.clone());
            }
            plugin.output_values(&mut out, &cancel, Utc::now())?;
        }

        out.flush()?;
        Ok(())
    }
}

/// Report a failed invocation on both the log and `out`.
///
/// The plain line is written even when `RUST_LOG` silences this crate.
pub fn report_failure<W: Write>(err: &anyhow::Error, out: &mut W) {
    error!("{:#}", err);
    let _ = writeln!(out, "Error: {:#}", err);
}

/// Fire `cancel` once `timeout` elapses. The thread is detached; process exit reaps it.
fn spawn_deadline(timeout: Duration, cancel: CancellationToken) {
    debug!("Scan deadline set to {:?}", timeout);
    std::thread::spawn(move || {
        std::thread::sleep(timeout);
        if !cancel.is_cancelled() {
            warn!("Scan exceeded {:?}, cancelling", timeout);
            cancel.cancel();
        }
    });
}
