use clap::Parser;
use colored::*;
use retrace::engine::ingest_reader;
use retrace::summary::{summarize_all, RequestSummary};
use retrace::*;
use std::sync::Arc;
use std::time::Duration;

fn format_tokens(tokens: Option<u64>) -> String {
    match tokens {
        Some(t) => t.to_string(),
        None => "-".to_string(),
    }
}

fn print_summary_row(summary: &RequestSummary) {
    let time = chrono::DateTime::from_timestamp_millis(summary.timestamp)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let status = if summary.status_code < 400 {
        summary.status_code.to_string().green()
    } else {
        summary.status_code.to_string().red()
    };
    let mut flags = Vec::new();
    if summary.is_summarization_request {
        flags.push("housekeeping".dimmed().to_string());
    }
    if summary.has_thinking {
        flags.push("thinking".cyan().to_string());
    }

    println!(
        "{} {} {} {:<32} {:>8.1}ms sys:{} msg:{} tools:{} in:{} out:{} {}",
        time,
        str_utils::prefix_chars(&summary.req_id, 12).bold(),
        status,
        summary.model,
        summary.response_time,
        summary.system_count,
        summary.message_count,
        summary.tool_count,
        format_tokens(summary.input_tokens),
        format_tokens(summary.output_tokens),
        flags.join(" ")
    );
}

async fn run_inspect(path: &str) -> Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let outcome = ingest_reader(file).await;
    let summaries = summarize_all(outcome.records.iter());

    for summary in &summaries {
        print_summary_row(summary);
    }

    let diag = outcome.diagnostics;
    println!(
        "{} {} requests, {} lines ({} skipped, {} unassigned), {} bad fragments",
        "==".bold(),
        diag.requests,
        diag.total_lines,
        diag.skipped_lines,
        diag.unassigned_events,
        diag.skipped_fragments
    );
    for sample in &diag.samples {
        println!("   {} {}", "skipped".yellow(), sample);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = logging::init_tracing(&args.log_dir);
    logging::setup_panic_hook();

    if let Some(path) = args.inspect.clone() {
        if let Err(e) = run_inspect(&path).await {
            eprintln!("Failed to inspect {}: {}", path, e.inner);
            std::process::exit(1);
        }
        return;
    }

    let state = Arc::new(AppState::new(args.clone()));

    if args.session_ttl().is_some() {
        let store = state.engine.store().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                store.evict_expired();
            }
        });
    }

    let app = api::router(state.clone());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("retrace listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
