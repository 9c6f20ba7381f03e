//! Host configuration
//!
//! Flags fall back to environment variables, then to defaults. The parsed
//! [`HostArgs`] are validated into a [`HostConfig`]; any validation error is
//! fatal at startup.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::registry::RegistryConfig;

/// Harbor plugin host
#[derive(Parser, Debug, Clone)]
#[command(name = "harbor")]
#[command(about = "Plugin host with separate control and data planes", long_about = None)]
pub struct HostArgs {
    /// Directory scanned for plugin archives
    #[arg(long, env = "PLUGINS_DIR", default_value = "./plugins")]
    pub plugins_dir: PathBuf,

    /// Where archives are extracted [default: <plugins-dir>/.harbor]
    #[arg(long, env = "HARBOR_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Control plane address
    #[arg(long, env = "INTERNAL_HTTP_HOST", default_value = "127.0.0.1")]
    pub internal_host: IpAddr,

    /// Control plane port
    #[arg(long, env = "INTERNAL_HTTP_PORT", default_value_t = 8666)]
    pub internal_port: u16,

    /// Data plane address
    #[arg(long, env = "EXTERNAL_HTTP_HOST", default_value = "0.0.0.0")]
    pub external_host: IpAddr,

    /// Data plane port
    #[arg(long, env = "EXTERNAL_HTTP_PORT", default_value_t = 8777)]
    pub external_port: u16,

    /// Bearer token required on the data plane
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Serve the data plane without authentication when no token is set
    #[arg(long, env = "HARBOR_ALLOW_ANONYMOUS")]
    pub allow_anonymous: bool,

    #[arg(long, env = "HARBOR_SCAN_INTERVAL_SECS", default_value_t = 30)]
    pub scan_interval_secs: u64,

    /// Grace period for in-flight invocations when a plugin is drained
    #[arg(long, env = "HARBOR_DRAIN_GRACE_MS", default_value_t = 5000)]
    pub drain_grace_ms: u64,

    #[arg(long, env = "HARBOR_INVOKE_TIMEOUT_MS", default_value_t = 30_000)]
    pub invoke_timeout_ms: u64,

    /// Upper bound for the per-request timeout header
    #[arg(long, env = "HARBOR_MAX_INVOKE_TIMEOUT_MS", default_value_t = 300_000)]
    pub max_invoke_timeout_ms: u64,

    /// Timed-out invocations a plugin may accumulate before it is failed
    #[arg(long, env = "HARBOR_MAX_ABANDONED", default_value_t = 8)]
    pub max_abandoned: u64,

    #[arg(long, env = "HARBOR_MAX_BODY_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Load and activate every discovered plugin at startup
    #[arg(long)]
    pub autoload: bool,

    /// Don't start the file watcher (periodic rescans still run)
    #[arg(long)]
    pub no_watch: bool,

    /// Emit logs as JSON
    #[arg(long, env = "HARBOR_LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("control and data plane cannot share the listen address {0}")]
    SharedAddress(SocketAddr),

    #[error("control plane {internal} overlaps data plane {external}")]
    OverlappingAddress {
        internal: SocketAddr,
        external: SocketAddr,
    },

    #[error("work directory must differ from the plugins directory ({})", .0.display())]
    WorkDirIsPluginsDir(PathBuf),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("default invocation timeout exceeds the maximum")]
    TimeoutAboveMax,
}

/// Validated host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub plugins_dir: PathBuf,
    pub work_dir: PathBuf,
    pub internal_addr: SocketAddr,
    pub external_addr: SocketAddr,
    pub auth_token: Option<String>,
    pub allow_anonymous: bool,
    pub scan_interval: Duration,
    pub drain_grace: Duration,
    pub invoke_timeout: Duration,
    pub max_invoke_timeout: Duration,
    pub max_abandoned: u64,
    pub max_body_bytes: usize,
    pub autoload: bool,
    pub watch: bool,
    pub log_json: bool,
}

impl HostConfig {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            drain_grace: self.drain_grace,
            max_abandoned: self.max_abandoned,
        }
    }
}

impl TryFrom<HostArgs> for HostConfig {
    type Error = ConfigError;

    fn try_from(args: HostArgs) -> Result<Self, Self::Error> {
        let internal_addr = SocketAddr::new(args.internal_host, args.internal_port);
        let external_addr = SocketAddr::new(args.external_host, args.external_port);

        if internal_addr == external_addr {
            return Err(ConfigError::SharedAddress(internal_addr));
        }
        // 0.0.0.0:p and 127.0.0.1:p cannot both be bound
        if internal_addr.port() == external_addr.port()
            && (internal_addr.ip().is_unspecified() || external_addr.ip().is_unspecified())
        {
            return Err(ConfigError::OverlappingAddress {
                internal: internal_addr,
                external: external_addr,
            });
        }

        let work_dir = args
            .work_dir
            .unwrap_or_else(|| args.plugins_dir.join(".harbor"));
        if work_dir == args.plugins_dir {
            return Err(ConfigError::WorkDirIsPluginsDir(work_dir));
        }

        for (name, value) in [
            ("scan interval", args.scan_interval_secs),
            ("invocation timeout", args.invoke_timeout_ms),
            ("max invocation timeout", args.max_invoke_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if args.max_body_bytes == 0 {
            return Err(ConfigError::Zero("max body bytes"));
        }
        if args.invoke_timeout_ms > args.max_invoke_timeout_ms {
            return Err(ConfigError::TimeoutAboveMax);
        }

        let auth_token = args.auth_token.filter(|t| !t.trim().is_empty());

        Ok(Self {
            plugins_dir: args.plugins_dir,
            work_dir,
            internal_addr,
            external_addr,
            auth_token,
            allow_anonymous: args.allow_anonymous,
            scan_interval: Duration::from_secs(args.scan_interval_secs),
            drain_grace: Duration::from_millis(args.drain_grace_ms),
            invoke_timeout: Duration::from_millis(args.invoke_timeout_ms),
            max_invoke_timeout: Duration::from_millis(args.max_invoke_timeout_ms),
            max_abandoned: args.max_abandoned,
            max_body_bytes: args.max_body_bytes,
            autoload: args.autoload,
            watch: !args.no_watch,
            log_json: args.log_json,
        })
    }
}
