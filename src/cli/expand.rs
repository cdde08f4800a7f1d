//! `timeledger expand`

use crate::server::{config::AppConfig, App};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use timeledger_core::{format_error_for_cli, ExpandedSchedule};

pub async fn run(
    config: AppConfig,
    center_id: i64,
    start: NaiveDate,
    end: NaiveDate,
    teacher_id: Option<i64>,
    json: bool,
) -> Result<()> {
    let app = App::build(config).await?;
    let result = match teacher_id {
        Some(teacher_id) => {
            app.service
                .expand_teacher(teacher_id, center_id, start, end)
                .await
        }
        None => app.service.expand_center(center_id, start, end).await,
    };
    app.close().await;

    let sessions = match result {
        Ok(sessions) => sessions,
        Err(e) => anyhow::bail!(format_error_for_cli(&e)),
    };

    if json {
        let out = serde_json::to_string_pretty(&sessions).context("Failed to encode sessions")?;
        println!("{}", out);
    } else {
        print_table(&sessions);
    }
    Ok(())
}

fn print_table(sessions: &[ExpandedSchedule]) {
    if sessions.is_empty() {
        println!("No sessions in range.");
        return;
    }
    println!(
        "{:<10}  {:<11}  {:<5}  {:<5}  {:>7}  {:>5}  {:<12}",
        "DATE", "TIME", "RULE", "ROOM", "TEACHER", "EXC", "STATUS"
    );
    for s in sessions {
        let teacher = s
            .teacher_id
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        let exception = s
            .exception_status
            .map(|st| st.as_str().to_string())
            .unwrap_or_default();
        println!(
            "{:<10}  {}-{}  {:<5}  {:<5}  {:>7}  {:>5}  {:<12}",
            s.date,
            s.start_time,
            s.end_time,
            s.rule_id,
            s.room_id,
            teacher,
            exception,
            format!("{:?}", s.status)
        );
    }
    println!("\n{} session(s)", sessions.len());
}
