use logger::logger;
use log::info;
use cluster::ReplicationConfig;
use server::Node;
use storage::{Storage, StorageConfig};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    logger::setup_logging();

    let ascii_logo = r#"
        _             __
   ____(_)___  ____  / /__
  / ___/ / __ \/ __ \/ / _ \
 / /  / / /_/ / /_/ / /  __/
/_/  /_/ .___/ .___/_/\___/
      /_/   /_/
-----------------------------------------------
Peer-to-peer eventually consistent replication
-----------------------------------------------
    "#;

    println!("{}", ascii_logo);

    let config = ReplicationConfig::from_env();

    let mut storage_config = StorageConfig::from_env();
    if storage_config.wal_path.is_none() {
        if let Some(dir) = &config.data_dir {
            storage_config = StorageConfig::with_wal(format!("{}/ripple.wal", dir))
                .with_compaction_threshold(storage_config.compaction_threshold);
        }
    }
    match &storage_config.wal_path {
        Some(path) => info!("Persistence enabled, WAL path: {}", path),
        None => info!("Running in memory-only mode (no persistence)"),
    }

    let storage = match Storage::with_config(storage_config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open storage: {}", e);
            std::process::exit(1);
        }
    };

    let node = match Node::start(config, storage).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Failed to start node: {}", e);
            std::process::exit(1);
        }
    };

    info!("Node {} listening on {}", node.node_id(), node.local_addr());

    if let Err(e) = tokio::signal::ctrl_c().await {
        info!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal, stopping node...");
    node.close();
}
