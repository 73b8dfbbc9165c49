//! insight-stream - ask the insights backend a question and stream the answer.
//!
//! ## Usage
//!
//! ```bash
//! # Stream an answer using INSIGHT_API_BASE_URL / INSIGHT_API_TOKEN from .env
//! insight-stream ask --question "How did revenue grow?" --company NASDAQ:AAPL
//!
//! # Focus on specific metrics and continue an existing chat session
//! insight-stream ask -q "Compare margins" --metric "Gross Margin" --metric "Net Margin" \
//!     --period 5Y --session-id 42
//!
//! # Print the final markdown without resolving figure placeholders
//! insight-stream ask -q "Summarize the 10-K" --raw
//!
//! # Attach a chart screenshot and a filing for multimodal questions
//! insight-stream ask -q "What stands out here?" --attach chart.png --attach 10k.pdf
//! ```

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use insight_stream::observability::init_observability;
use insight_stream::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "insight-stream", version, about = "Stream AI report answers from the insights backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask a question and stream the answer to stdout.
    Ask {
        /// Question to send.
        #[arg(short, long)]
        question: String,
        /// Company ticker, optionally prefixed with the exchange (`NASDAQ:AAPL`).
        #[arg(short, long)]
        company: Option<String>,
        /// Reporting period (`ALL`, `5Y`, ...).
        #[arg(long, default_value = "ALL")]
        period: String,
        /// Metric to focus on; repeatable.
        #[arg(long = "metric")]
        metrics: Vec<String>,
        /// Chart type shown next to the question.
        #[arg(long, default_value = "line")]
        chart_type: String,
        /// Existing chat session to continue.
        #[arg(long)]
        session_id: Option<String>,
        /// File to send along with the question; repeatable.
        #[arg(long = "attach", value_name = "PATH")]
        attachments: Vec<PathBuf>,
        /// Overrides INSIGHT_API_BASE_URL.
        #[arg(long)]
        base_url: Option<String>,
        /// Print the final content without resolving figure placeholders.
        #[arg(long)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_observability("warn");

    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<bool> {
    let cli = Cli::parse();

    match cli.command {
        Command::Ask {
            question,
            company,
            period,
            metrics,
            chart_type,
            session_id,
            attachments,
            base_url,
            raw,
        } => {
            let config = match base_url {
                Some(base_url) => with_env_credentials(ClientConfig::new(base_url)),
                None => ClientConfig::from_env().context("loading client configuration")?,
            };
            let source = HttpReportSource::new(config).context("building HTTP report source")?;

            let mut request = ReportRequest::new(question)
                .period(period)
                .chart_type(chart_type);
            if let Some(company) = company {
                request = request.company(&company);
            }
            for metric in metrics {
                request = request.metric(metric);
            }
            if let Some(session_id) = session_id {
                request = request.session_id(session_id);
            }
            for path in &attachments {
                request = attach_file(request, path)?;
            }

            ask(Assembler::new(Arc::new(source)), request, raw).await
        }
    }
}

/// Content printed after streaming ends; `raw` keeps figure placeholders.
fn final_markdown(outcome: &AssemblyOutcome, raw: bool) -> Option<String> {
    if raw {
        outcome.content().map(ToOwned::to_owned)
    } else {
        outcome.rendered_content()
    }
}

fn attach_file(request: ReportRequest, path: &Path) -> Result<ReportRequest> {
    let contents =
        std::fs::read(path).with_context(|| format!("reading attachment {}", path.display()))?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    tracing::debug!(path = %path.display(), %mime, bytes = contents.len(), "attaching file");
    Ok(request.attach(mime.essence_str(), &contents))
}

fn with_env_credentials(config: ClientConfig) -> ClientConfig {
    match std::env::var("INSIGHT_API_TOKEN") {
        Ok(token) if !token.trim().is_empty() => config.bearer_token(token.trim()),
        _ => config,
    }
}

async fn ask(assembler: Assembler, request: ReportRequest, raw: bool) -> Result<bool> {
    let mut stream = assembler.request(request).start_stream().await?;
    let mut stdout = std::io::stdout();
    let mut printed = 0_usize;

    while let Some(event) = stream.next_event().await {
        match event {
            AssemblyEvent::ContentUpdated { content, .. } => {
                // content only grows, print the new suffix
                if content.len() >= printed && content.is_char_boundary(printed) {
                    write!(stdout, "{}", &content[printed..])?;
                } else {
                    write!(stdout, "\n{content}")?;
                }
                stdout.flush()?;
                printed = content.len();
            }
            AssemblyEvent::SessionAcknowledged {
                session_id: Some(session_id),
                ..
            } => tracing::info!(%session_id, "chat session acknowledged"),
            AssemblyEvent::Failed { failure, .. } => eprintln!("\nrequest failed: {failure}"),
            _ => {}
        }
    }

    let outcome = stream.finish().await?;
    match final_markdown(&outcome, raw) {
        Some(markdown) => writeln!(stdout, "\n\n---\n{markdown}")?,
        None => writeln!(stdout)?,
    }
    if let Some(session_id) = outcome.session_id.as_deref() {
        eprintln!("session: {session_id}");
    }
    Ok(outcome.is_completed())
}
