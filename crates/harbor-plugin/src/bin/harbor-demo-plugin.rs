//! Demo plugin
//!
//! Usage: `harbor-demo-plugin [prefix]` (default prefix `demo`)
//!
//! Capabilities:
//! - `<prefix>.echo` - replies with the request body
//! - `<prefix>.sleep` - sleeps for the body's number of milliseconds
//! - `<prefix>.fail` - fails with the body as the error message
//! - `<prefix>.crash` - exits the process without replying
//! - `<prefix>.info` - plugin id, generation, pid and config as JSON

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use harbor_plugin::{LogLevel, Plugin, PluginContext, PluginError};

struct Demo {
    prefix: String,
}

#[async_trait]
impl Plugin for Demo {
    fn capabilities(&self) -> Vec<String> {
        ["echo", "sleep", "fail", "crash", "info"]
            .iter()
            .map(|name| format!("{}.{}", self.prefix, name))
            .collect()
    }

    async fn start(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        ctx.log(
            LogLevel::Info,
            format!("demo plugin ready as {} (generation {})", ctx.plugin(), ctx.generation()),
        )
        .await;
        Ok(())
    }

    async fn invoke(
        &self,
        ctx: &PluginContext,
        capability: &str,
        body: Bytes,
    ) -> Result<Bytes, PluginError> {
        let name = capability
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(|| PluginError::UnknownCapability(capability.to_string()))?;

        match name {
            "echo" => Ok(body),
            "sleep" => {
                let millis: u64 = std::str::from_utf8(&body)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| PluginError::BadRequest("expected milliseconds".into()))?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(body)
            }
            "fail" => Err(PluginError::failed(String::from_utf8_lossy(&body))),
            "crash" => {
                tracing::error!("Crashing on request");
                std::process::exit(3);
            }
            "info" => {
                let info = json!({
                    "plugin": ctx.plugin(),
                    "generation": ctx.generation(),
                    "pid": std::process::id(),
                    "config": ctx.config(),
                });
                Ok(Bytes::from(info.to_string()))
            }
            _ => Err(PluginError::UnknownCapability(capability.to_string())),
        }
    }

    async fn stop(&self) {
        tracing::info!("Demo plugin stopping");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    harbor_plugin::init_tracing();

    let prefix = std::env::args().nth(1).unwrap_or_else(|| "demo".to_string());
    harbor_plugin::run(Demo { prefix }).await
}
