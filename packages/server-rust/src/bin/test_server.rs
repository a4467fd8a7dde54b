//! Skein test server: serves a small set of demo procedures over HTTP batch and WebSocket.

use std::time::Duration;

use clap::Parser;
use futures_util::stream;
use serde_json::{json, Value};
use skein_core::ErrorCode;
use skein_server::network::NetworkConfig;
use skein_server::service::{ProcedureCall, ProcedureError, ProcedureStream};
use skein_server::{NetworkModule, ProcedureRouter, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Skein test server", long_about = None)]
struct Args {
    /// Bind address
    #[arg(long, env = "SKEIN_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on, 0 for an OS-assigned port
    #[arg(long, env = "SKEIN_PORT", default_value_t = 3000)]
    port: u16,

    /// Deadline for a single procedure call
    #[arg(long, env = "SKEIN_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    /// Concurrent calls before load shedding
    #[arg(long, env = "SKEIN_MAX_CONCURRENT", default_value_t = 1000)]
    max_concurrent: u32,

    /// Emit logs as JSON lines
    #[arg(long, env = "SKEIN_LOG_JSON")]
    log_json: bool,
}

fn procedures() -> ProcedureRouter {
    ProcedureRouter::new()
        .query("greeting", |call: ProcedureCall| async move {
            let name = call.input["name"].as_str().unwrap_or("world").to_string();
            Ok(json!(format!("hello {name}")))
        })
        .query("echo", |call: ProcedureCall| async move { Ok(call.input) })
        .query("slow", |call: ProcedureCall| async move {
            let ms = call.input.as_u64().unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        })
        .query("fail", |call: ProcedureCall| async move {
            let message = call.input.as_str().unwrap_or("requested failure").to_string();
            Err::<Value, _>(ProcedureError::new(ErrorCode::BadRequest, message))
        })
        .query("feed", |call: ProcedureCall| async move {
            // Cursor-paged feed for polling subscriptions: one item per page.
            let cursor = call.input["cursor"].as_u64().unwrap_or(0);
            Ok(json!({ "data": { "seq": cursor }, "nextInput": { "cursor": cursor + 1 } }))
        })
        .mutation("add", |call: ProcedureCall| async move {
            let a = call.input["a"].as_i64().unwrap_or(0);
            let b = call.input["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        })
        .subscription("ticks", |call: ProcedureCall| async move {
            let count = call.input["count"].as_u64().unwrap_or(u64::MAX);
            let every = Duration::from_millis(call.input["every_ms"].as_u64().unwrap_or(1000));
            let ticks: ProcedureStream = Box::pin(stream::unfold(0u64, move |n| async move {
                if n >= count {
                    return None;
                }
                tokio::time::sleep(every).await;
                Some((Ok(json!(n)), n + 1))
            }));
            Ok(ticks)
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let network = NetworkConfig {
        host: args.host,
        port: args.port,
        ..NetworkConfig::default()
    };
    let server = ServerConfig {
        default_operation_timeout_ms: args.request_timeout_ms,
        max_concurrent_operations: args.max_concurrent,
        ..ServerConfig::default()
    };

    let mut module = NetworkModule::new(network, server, procedures());
    let port = module.start().await?;
    info!(port, "skein test server listening");

    module
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
}
