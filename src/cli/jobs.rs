//! `timeledger jobs`

use super::JobsCommand;
use crate::server::{config::AppConfig, App};
use anyhow::Result;
use timeledger_core::format_error_for_cli;

pub async fn run(config: AppConfig, command: JobsCommand) -> Result<()> {
    let app = App::build(config).await?;
    let scheduler = app.job_scheduler()?;

    let result = match command {
        JobsCommand::List => {
            for name in scheduler.job_names() {
                println!("{}", name);
            }
            Ok(())
        }
        JobsCommand::Run { name } => match scheduler.run_once(&name).await {
            Ok(summary) => {
                println!("{}: {}", name, summary);
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!(format_error_for_cli(&e))),
        },
    };

    app.close().await;
    result
}
