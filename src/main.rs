use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use sqlcrew::assistant::Assistant;
use sqlcrew::config::{AppConfig, CliArgs, Command};
use sqlcrew::pipeline::stage::{StagePayload, StageResult};
use sqlcrew::util::logging::init_tracing;
use sqlcrew::web::{self, state::AppState};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Initialize logging
    init_tracing(args.log_json);

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let assistant = Assistant::from_config(&config)?;

    let command = args.command.clone().unwrap_or(Command::Serve {
        host: None,
        port: None,
    });

    match command {
        Command::Serve { .. } => serve(config, assistant).await,
        Command::Ask {
            question,
            strategy,
            model,
            timeout_secs,
        } => {
            let mut options = assistant.default_options();
            if let Some(strategy) = strategy {
                options.strategy = strategy;
            }
            options.model = model;
            ask(&assistant, &question, options, timeout_secs).await
        }
        Command::Schema => {
            let schema = assistant.schema().await?;
            println!("{}", schema.to_prompt_context());
            let sensitive = schema.sensitive_columns();
            if !sensitive.is_empty() {
                println!("\n-- sensitive columns: {}", sensitive.into_iter().collect::<Vec<_>>().join(", "));
            }
            println!("-- ~{} tokens", schema.token_estimate());
            Ok(())
        }
        Command::Compare { question } => {
            let results = assistant.compare_strategies(&question).await?;
            println!(
                "{:<18} {:>7} {:>7} {:>9} {:>10}  tables",
                "strategy", "tokens", "full", "saved %", "ms"
            );
            for result in &results {
                println!(
                    "{:<18} {:>7} {:>7} {:>9.1} {:>10.2}  {}{}",
                    result.strategy.as_str(),
                    result.token_estimate,
                    result.full_token_estimate,
                    result.token_reduction_pct(),
                    result.latency_ms,
                    result.table_names().join(", "),
                    if result.fell_back { " (fallback)" } else { "" }
                );
            }
            Ok(())
        }
        Command::RebuildIndex => {
            assistant.rebuild_indexes().await?;
            println!("Vector indexes rebuilt from the live schema");
            Ok(())
        }
    }
}

async fn serve(config: AppConfig, assistant: Assistant) -> Result<(), BoxError> {
    // Take the first schema snapshot and build indexes before accepting requests
    if let Err(e) = assistant.refresh_schema().await {
        error!("Initial schema refresh failed: {}", e);
    }

    let web_config = config.web.clone();
    let app_state = Arc::new(AppState::new(config, assistant));

    info!("Starting sqlcrew server on {}:{}", web_config.host, web_config.port);
    match web::run_server(web_config, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e);
        }
    }
    Ok(())
}

async fn ask(
    assistant: &Assistant,
    question: &str,
    options: sqlcrew::pipeline::SessionOptions,
    timeout_secs: Option<u64>,
) -> Result<(), BoxError> {
    let (mut stages, handle) = assistant.submit(question, options).await?;
    let abort = handle.abort_handle();

    let streamed = async move {
        while let Some(stage) = stages.recv().await {
            print_stage(&stage)?;
        }
        Ok::<_, BoxError>(handle.await?)
    };

    let run = match timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), streamed).await {
            Ok(run) => run?,
            Err(_) => {
                abort.abort();
                return Err(format!("no answer within {} seconds", secs).into());
            }
        },
        None => streamed.await?,
    };

    println!(
        "\n{:?} in {:.0} ms, {} prompt + {} completion tokens, ${:.6} ({})",
        run.status,
        run.totals.elapsed_ms,
        run.totals.prompt_tokens,
        run.totals.completion_tokens,
        run.totals.usd,
        run.model
    );
    Ok(())
}

fn print_stage(stage: &StageResult) -> Result<(), BoxError> {
    println!(
        "[{}] {:?} ({:.1} ms, ${:.6})",
        stage.stage, stage.status, stage.elapsed_ms, stage.cost.usd
    );
    match &stage.payload {
        StagePayload::Generated { sql } | StagePayload::Reviewed { sql, .. } => {
            println!("    {}", sql);
        }
        StagePayload::Rows(rows) => {
            println!("    {}", rows.columns.join(" | "));
            for row in &rows.rows {
                let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                println!("    {}", cells.join(" | "));
            }
            if rows.truncated {
                println!("    ... truncated at {} rows ({:?})", rows.row_count, rows.truncation);
            }
        }
        other => println!("    {}", serde_json::to_string(other)?),
    }
    Ok(())
}
