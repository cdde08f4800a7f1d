//! `timeledger register`

use crate::server::{config::AppConfig, App};
use anyhow::Result;
use timeledger_core::format_error_for_cli;
use timeledger_core::models::NewTeacher;

pub async fn run(config: AppConfig, handle: &str, name: String, email: Option<String>) -> Result<()> {
    let app = App::build(config).await?;
    let profile = NewTeacher {
        name,
        email,
        ..NewTeacher::default()
    };
    let result = app.registrar.register(handle, profile).await;
    app.close().await;

    match result {
        Ok(outcome) => {
            let verb = if outcome.created { "Created" } else { "Found" };
            println!("{} teacher {} ({})", verb, outcome.teacher.id, outcome.teacher.name);
            Ok(())
        }
        Err(e) => anyhow::bail!(format_error_for_cli(&e)),
    }
}
