//! `synapse doctor` — configuration and dependency checks.

use anyhow::Result;

use synapse_engine::store::StateStore;
use synapse_engine::{Config, SqliteStateStore};

pub async fn run() -> Result<()> {
    println!("synapse doctor");

    match Config::from_env() {
        Ok(config) => {
            println!("  [ok] configuration valid");
            println!(
                "       segment_timeout_ms={} checkpoint_threshold_ms={}",
                config.engine.segment_timeout_ms, config.engine.checkpoint_threshold_ms
            );
            if config.queue.signing_secret.is_none() {
                println!("  [warn] SYNAPSE_QUEUE_SIGNING_SECRET unset; queue deliveries unsigned");
            } else {
                println!("  [ok] queue signing secret configured");
            }
            if config.api.service_token.is_none() {
                println!("  [warn] SYNAPSE_SERVICE_TOKEN unset; /mesh/resume will reject callers");
            }

            let path = config
                .store
                .path
                .clone()
                .unwrap_or_else(synapse_engine::config::StoreConfig::default_path);
            match SqliteStateStore::open(&path) {
                Ok(store) => {
                    let probe = store.set_nx("doctor:probe", "ok", None).await;
                    match probe {
                        Ok(_) => {
                            let _ = store.delete("doctor:probe").await;
                            println!("  [ok] state store writable at {}", path.display());
                        }
                        Err(e) => println!("  [fail] state store probe write: {e}"),
                    }
                }
                Err(e) => println!("  [fail] cannot open state store at {}: {e}", path.display()),
            }
        }
        Err(e) => {
            println!("  [fail] configuration: {e}");
            anyhow::bail!("configuration invalid");
        }
    }

    Ok(())
}
