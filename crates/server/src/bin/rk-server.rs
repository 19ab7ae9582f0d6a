use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use rk_common::config::{PdConfig, ScheduleConfig};
use rk_server::{PdServer, ServerOptions};
use rk_storage::MemoryKv;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool_or_default(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bind = env_or_default("RK_BIND", "0.0.0.0:2379");
    let addr: SocketAddr = bind.parse()?;
    let advertise = env_or_default("RK_ADVERTISE_ADDR", &bind);
    let cluster_name = env_or_default("RK_CLUSTER_NAME", "pd");
    let update_physical_interval_ms = env_u64_or_default("RK_TSO_UPDATE_PHYSICAL_INTERVAL_MS", 50);
    let save_interval_ms = env_u64_or_default("RK_TSO_SAVE_INTERVAL_MS", 3_000);
    let leader_lease_ms = env_u64_or_default("RK_LEADER_LEASE_MS", 3_000);
    let region_schedule_limit = env_u64_or_default("RK_REGION_SCHEDULE_LIMIT", 2_048);
    let schedule_interval_ms = env_u64_or_default("RK_SCHEDULE_INTERVAL_MS", 1_000);
    let max_concurrent_tso_proxy_streamings =
        env_usize_or_default("RK_MAX_CONCURRENT_TSO_PROXY_STREAMINGS", 5_000);
    let tso_service_enabled = env_bool_or_default("RK_TSO_SERVICE_ENABLED", false);
    let scheduling_service_enabled = env_bool_or_default("RK_SCHEDULING_SERVICE_ENABLED", false);

    let config = PdConfig {
        cluster_name,
        advertise_addr: advertise.clone(),
        update_physical_interval_ms,
        save_interval_ms,
        leader_lease_ms,
        max_concurrent_tso_proxy_streamings,
        ..PdConfig::default()
    };
    let schedule = ScheduleConfig {
        region_schedule_limit,
        schedule_interval_ms,
        ..ScheduleConfig::default()
    };
    let options = ServerOptions {
        tso_service_enabled,
        scheduling_service_enabled,
    };

    // The backing consensus store is an external collaborator; a single
    // node runs against the in-process backend.
    let kv = Arc::new(MemoryKv::new());
    let server = PdServer::new(kv, config, schedule, options).await?;
    server.start();

    println!(
        "rk-server listening on {addr} (advertise={advertise}, tso_service={tso_service_enabled}, scheduling_service={scheduling_service_enabled})"
    );
    server.serve(addr).await?;
    Ok(())
}
