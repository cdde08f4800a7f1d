//! `timeledger doctor`

use crate::server::{config::AppConfig, App};
use anyhow::Result;

pub async fn run(config: AppConfig) -> Result<()> {
    println!("TimeLedger v{}", env!("CARGO_PKG_VERSION"));
    println!("  timezone       {}", config.core.timezone);
    println!("  storage        {}", config.store.backend);
    println!("  cache          {}", config.store.cache_backend);

    let mut failures = 0;
    match config.core.validate() {
        Ok(()) => println!("[ok]   core configuration"),
        Err(e) => {
            failures += 1;
            println!("[fail] core configuration: {}", e);
        }
    }

    match App::build(config).await {
        Ok(app) => {
            match app.backends.health_check().await {
                Ok(true) => println!("[ok]   storage reachable"),
                Ok(false) => {
                    failures += 1;
                    println!("[fail] storage health check returned false");
                }
                Err(e) => {
                    failures += 1;
                    println!("[fail] storage: {}", e);
                }
            }
            match app.job_scheduler() {
                Ok(scheduler) => println!("[ok]   jobs: {}", scheduler.job_names().join(", ")),
                Err(e) => {
                    failures += 1;
                    println!("[fail] jobs: {:#}", e);
                }
            }
            app.close().await;
        }
        Err(e) => {
            failures += 1;
            println!("[fail] startup: {:#}", e);
        }
    }

    if failures > 0 {
        anyhow::bail!("{} check(s) failed", failures);
    }
    println!("All checks passed");
    Ok(())
}
