use shardgate::config::{ConfigOverrides, GatewayOverrides, HostOverrides, ShardgateConfig};
use shardgate::gateway::{pacing_gates, BucketPlan, ShardTopology, WorkerRouter};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn parse_u32(flag: &str) -> anyhow::Result<Option<u32>> {
    parse_arg(flag)
        .map(|value| {
            value
                .parse::<u32>()
                .map_err(|e| anyhow::anyhow!("invalid value for {flag}: {value} ({e})"))
        })
        .transpose()
}

fn print_help() {
    eprintln!(
        r#"shardgate_plan - Print the shard identify plan

USAGE:
    shardgate_plan [OPTIONS]

OPTIONS:
    -c, --config <FILE>          Path to config file (TOML)
        --total-shards <N>       Override the requested total shard count
        --max-concurrency <N>    Override the host's identify concurrency
        --first <ID>             First shard id owned by this process
        --last <ID>              Last shard id owned by this process
    -h, --help                   Print help

ENVIRONMENT:
    SHARDGATE_CONFIG                     Path to config file
    SHARDGATE_GATEWAY__TOTAL_SHARDS      Requested total shard count
    SHARDGATE_HOST__MAX_CONCURRENCY      Host identify concurrency
    RUST_LOG                             Log filter [default: info]

CONFIG FILE (shardgate.toml):
    [gateway]
    total_shards = 32
    shards_per_worker = 8
    total_workers = 4

    [host]
    max_concurrency = 4
"#
    );
}

fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let gateway = GatewayOverrides {
        total_shards: parse_u32("--total-shards")?,
        first_shard_id: parse_u32("--first")?,
        last_shard_id: parse_u32("--last")?,
        ..GatewayOverrides::default()
    };
    let host = HostOverrides {
        max_concurrency: parse_u32("--max-concurrency")?,
    };
    let overrides = ConfigOverrides {
        gateway: Some(gateway),
        host: Some(host),
    };

    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("SHARDGATE_CONFIG").ok());
    let config = ShardgateConfig::load(config_path.as_deref(), overrides)?;

    let topology = ShardTopology::from_config(&config.gateway, &config.host)?;
    let router = WorkerRouter::new(config.gateway.shards_per_worker, config.gateway.total_workers)?;
    let gates = pacing_gates(topology.max_concurrency, config.gateway.spawn_shard_delay());
    let plan = BucketPlan::prepare(&topology, &router, &gates)?;

    println!(
        "total shards: {} (shards {}..={}, max concurrency {})",
        topology.total_shards,
        topology.first_shard_id,
        topology.last_shard_id,
        topology.max_concurrency
    );
    println!(
        "pacing interval: {}ms per bucket, session starts reset every {}s",
        config.gateway.spawn_shard_delay_ms,
        config.host.reset_window().as_secs()
    );
    for bucket in plan.buckets() {
        println!("bucket {}:", bucket.id);
        for worker in &bucket.workers {
            let shards: Vec<String> = worker.shard_ids.iter().map(u32::to_string).collect();
            println!("  worker {}: {}", worker.worker_id, shards.join(", "));
        }
    }
    println!("{} shards planned", plan.shard_count());

    Ok(())
}
