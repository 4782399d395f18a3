//! Command-line front end: run a suite, diff or show stored tests, clean the
//! store, or compare two URLs ad hoc.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::compare::{ChunkTag, DiffChunk};
use crate::config::{Defaults, RouteConfig, SideRouteConfig, SuiteConfig, DEFAULT_CONFIG_FILE};
use crate::error::{
    ConfigError, DiffError, LookupError, SessionError, StoreError, TransportError,
};
use crate::http::{HttpMethod, ReqwestFetcher, StoredResponse, DEFAULT_TIMEOUT_MS};
use crate::route::{short_id, Side, SuitePlan};
use crate::storage::ResponseStore;
use crate::testing::{SessionBuilder, SessionEvent, TestDiff, TestSummary};

#[derive(Debug, Parser)]
#[command(name = "routediff", version, about = "Compare responses of paired HTTP routes")]
pub struct Cli {
    /// Response store location (default: .routediff/responses.db)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run every route of a config file
    Run(RunArgs),
    /// Diff a stored test by id, or two URLs against each other
    Diff(DiffArgs),
    /// Print both stored responses of a test
    Show {
        /// Test id or unique prefix
        id: String,
    },
    /// Delete all stored responses
    Clean {
        /// Actually delete instead of only counting
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Tests run in parallel (overrides defaults.rateLimit)
    #[arg(short, long)]
    pub rate: Option<usize>,

    /// Only run routes with this tag
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Per-request timeout in milliseconds (overrides defaults.timeoutMs)
    #[arg(long)]
    pub timeout: Option<u64>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct DiffArgs {
    /// A test id, or a left and a right URL
    #[arg(required = true, num_args = 1..=2)]
    pub targets: Vec<String>,

    /// Also print unchanged chunks
    #[arg(long)]
    pub full: bool,

    /// Method for ad-hoc URL comparison
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: HttpMethod,

    /// Header for both sides, `Name: value`
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Header for the left side only
    #[arg(short = 'L', long = "left-header")]
    pub left_headers: Vec<String>,

    /// Header for the right side only
    #[arg(short = 'R', long = "right-header")]
    pub right_headers: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout: u64,
}

/// Output format for run reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error("Invalid header `{0}`, expected `Name: value`")]
    InvalidHeader(String),

    #[error("Invalid URL `{0}`, expected an absolute http(s) URL")]
    InvalidUrl(String),

    #[error("Failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}

/// Runs a parsed command. `Ok(false)` means the command worked but found
/// differences or failures.
pub async fn execute(cli: Cli) -> Result<bool, CliError> {
    let store_path = cli.store.unwrap_or_else(ResponseStore::default_path);
    debug!(store = %store_path.display(), "opening response store");
    let store = Arc::new(ResponseStore::open(&store_path)?);

    match cli.command {
        Command::Run(args) => run_suite(args, store).await,
        Command::Diff(args) => match args.targets.as_slice() {
            [left, right] => diff_urls(left, right, &args, store).await,
            targets => {
                let id = targets.first().map(String::as_str).unwrap_or_default();
                diff_stored(&store, id, args.full)
            }
        },
        Command::Show { id } => show(&store, &id),
        Command::Clean { force } => clean(&store, force),
    }
}

async fn run_suite(args: RunArgs, store: Arc<ResponseStore>) -> Result<bool, CliError> {
    let mut plan = SuiteConfig::load(&args.config)?.into_plan()?;
    if let Some(tag) = &args.tag {
        plan = plan.filter_tag(tag);
    }
    if let Some(rate) = args.rate {
        plan = plan.with_rate_limit(rate);
    }
    if let Some(timeout) = args.timeout {
        plan = plan.with_timeout(timeout);
    }

    let report = run_plan(plan, store, args.format).await?;
    let passed = report.iter().all(|test| test.failure_reason.is_none());
    match args.format {
        OutputFormat::Text => println!("{}", render_totals(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(passed)
}

/// Runs the plan, streaming one line per finished test in text mode.
async fn run_plan(
    plan: SuitePlan,
    store: Arc<ResponseStore>,
    format: OutputFormat,
) -> Result<Vec<TestSummary>, CliError> {
    let fetcher = Arc::new(ReqwestFetcher::new()?);
    let mut session = SessionBuilder::new(plan, fetcher, store).build();

    let events = session.subscribe();
    let printer = tokio::spawn(print_events(events, format));
    let result = session.run().await;
    let _ = printer.await;

    result?;
    Ok(session.report())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>, format: OutputFormat) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::TestFinished(test) if format == OutputFormat::Text => {
                println!("{}", render_summary(&test));
            }
            SessionEvent::Finished(_) | SessionEvent::Error(_) => break,
            _ => {}
        }
    }
}

fn diff_stored(store: &ResponseStore, prefix: &str, full: bool) -> Result<bool, CliError> {
    let (test_id, diff) = store.diff_by_id(prefix)?;
    let name = store
        .get_record(&test_id)?
        .map(|record| record.name)
        .unwrap_or_default();
    println!("{} {name}", short_id(&test_id));
    print!("{}", render_diff(&diff, full));
    Ok(!diff.has_changes())
}

async fn diff_urls(
    left: &str,
    right: &str,
    args: &DiffArgs,
    store: Arc<ResponseStore>,
) -> Result<bool, CliError> {
    for url in [left, right] {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CliError::InvalidUrl(url.to_string()));
        }
    }

    let side = |url: &str, headers: &[String]| -> Result<SideRouteConfig, CliError> {
        Ok(SideRouteConfig {
            url: Some(url.to_string()),
            headers: parse_header_lines(headers)?,
            ..SideRouteConfig::default()
        })
    };
    let config = SuiteConfig {
        defaults: Defaults {
            timeout_ms: Some(args.timeout),
            ..Defaults::default()
        },
        routes: vec![RouteConfig {
            method: Some(args.method),
            headers: parse_header_lines(&args.headers)?,
            left: Some(side(left, &args.left_headers)?),
            right: Some(side(right, &args.right_headers)?),
            ..RouteConfig::default()
        }],
    };

    let plan = config.into_plan()?;
    let report = run_plan(plan, store.clone(), OutputFormat::Text).await?;
    let Some(test) = report.first() else {
        return Ok(true);
    };

    // Responses are only missing when a side failed to download.
    match store.diff_by_id(&test.id) {
        Ok((_, diff)) => print!("{}", render_diff(&diff, args.full)),
        Err(DiffError::MissingResponse { .. }) => {}
        Err(err) => return Err(err.into()),
    }
    Ok(test.failure_reason.is_none())
}

fn show(store: &ResponseStore, prefix: &str) -> Result<bool, CliError> {
    let test_id = store.lookup_by_prefix(prefix)?;
    if let Some(record) = store.get_record(&test_id)? {
        println!("{} {} [{}]", short_id(&test_id), record.name, record.state);
        if let Some(reason) = record.failure_reason {
            println!("  {reason}");
        }
    }

    for side in Side::ALL {
        println!("\n{side}:");
        match store.get(&test_id, side)? {
            Some(response) => println!("{}", render_response(&response)?),
            None => println!("  (no response stored)"),
        }
    }
    Ok(true)
}

fn clean(store: &ResponseStore, force: bool) -> Result<bool, CliError> {
    if !force {
        let count = store.count()?;
        println!("{count} stored responses would be deleted, rerun with --force");
        return Ok(true);
    }
    let removed = store.clear()?;
    println!("Deleted {removed} stored responses");
    Ok(true)
}

/// Parses `Name: value` pairs. Later pairs win.
pub fn parse_header_lines(lines: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    let mut headers = BTreeMap::new();
    for line in lines {
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }

        let (key, value) = raw
            .split_once(':')
            .ok_or_else(|| CliError::InvalidHeader(raw.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(CliError::InvalidHeader(raw.to_string()));
        }
        headers.insert(key.to_string(), value.trim().to_string());
    }
    Ok(headers)
}

pub fn render_summary(test: &TestSummary) -> String {
    let mut line = format!("{}  {:<16} {}", test.short_id(), test.state, test.name);
    if let Some(reason) = &test.failure_reason {
        line.push_str(&format!("  ({reason})"));
    }
    line
}

fn render_totals(report: &[TestSummary]) -> String {
    let failed = report
        .iter()
        .filter(|test| test.failure_reason.is_some())
        .count();
    format!("\n{} passed, {failed} failed", report.len() - failed)
}

pub fn render_diff(diff: &TestDiff, full: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "status: {} / {}   time: {}ms / {}ms\n",
        diff.meta.left.status,
        diff.meta.right.status,
        diff.meta.left.response_time,
        diff.meta.right.response_time
    ));
    out.push_str("\nheaders:\n");
    out.push_str(&render_chunks(&diff.header_diff, full));
    out.push_str("\nbody:\n");
    out.push_str(&render_chunks(&diff.body_diff, full));
    out
}

/// Unified-style rendering. Without `full`, unchanged chunks are skipped.
pub fn render_chunks(chunks: &[DiffChunk], full: bool) -> String {
    let mut out = String::new();
    for chunk in chunks {
        let marker = match chunk.tag {
            ChunkTag::Unchanged if !full => continue,
            ChunkTag::Unchanged => ' ',
            ChunkTag::Added => '+',
            ChunkTag::Removed => '-',
        };
        for line in chunk.value.lines() {
            out.push(marker);
            out.push(' ');
            out.push_str(line);
            out.push('\n');
        }
    }
    if out.is_empty() {
        out.push_str("  (no differences)\n");
    }
    out
}

fn render_response(response: &StoredResponse) -> Result<String, CliError> {
    Ok(serde_json::to_string_pretty(response)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ResponseMeta;
    use serde_json::json;

    #[test]
    fn parses_header_lines() {
        let headers = parse_header_lines(&[
            "Accept: application/json".to_string(),
            "  ".to_string(),
            "X-Token:  abc:def ".to_string(),
        ])
        .expect("headers");
        assert_eq!(headers.get("Accept").map(String::as_str), Some("application/json"));
        assert_eq!(headers.get("X-Token").map(String::as_str), Some("abc:def"));
    }

    #[test]
    fn rejects_malformed_header_lines() {
        assert!(matches!(
            parse_header_lines(&["no separator".to_string()]),
            Err(CliError::InvalidHeader(_))
        ));
        assert!(matches!(
            parse_header_lines(&[": value".to_string()]),
            Err(CliError::InvalidHeader(_))
        ));
    }

    #[test]
    fn parses_ad_hoc_diff_arguments() {
        let cli = Cli::try_parse_from([
            "routediff",
            "diff",
            "http://a.test/x",
            "http://b.test/x",
            "-H",
            "Accept: text/plain",
            "-R",
            "Accept: application/json",
            "-X",
            "POST",
        ])
        .expect("cli");
        let Command::Diff(args) = cli.command else {
            panic!("expected diff");
        };
        assert_eq!(args.targets, vec!["http://a.test/x", "http://b.test/x"]);
        assert_eq!(args.method, HttpMethod::Post);
        assert_eq!(args.right_headers, vec!["Accept: application/json"]);
        assert!(args.left_headers.is_empty());
    }

    #[test]
    fn diff_rejects_three_targets() {
        assert!(Cli::try_parse_from(["routediff", "diff", "a", "b", "c"]).is_err());
    }

    #[test]
    fn run_defaults_to_the_standard_config_file() {
        let cli = Cli::try_parse_from(["routediff", "run", "-r", "4", "--verbose"]).expect("cli");
        assert!(cli.verbose);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert_eq!(args.rate, Some(4));
        assert_eq!(args.format, OutputFormat::Text);
    }

    #[test]
    fn renders_only_changes_unless_full() {
        let chunks = vec![
            DiffChunk {
                tag: ChunkTag::Unchanged,
                value: "{\n".into(),
            },
            DiffChunk {
                tag: ChunkTag::Removed,
                value: "  \"a\": 1\n".into(),
            },
            DiffChunk {
                tag: ChunkTag::Added,
                value: "  \"a\": 2\n".into(),
            },
        ];
        assert_eq!(render_chunks(&chunks, false), "-   \"a\": 1\n+   \"a\": 2\n");
        assert!(render_chunks(&chunks, true).starts_with("  {\n"));
        assert_eq!(render_chunks(&chunks[..1], false), "  (no differences)\n");
    }

    #[test]
    fn renders_summaries_with_reasons() {
        let summary = TestSummary {
            index: 0,
            id: "0123456789abcdef0123456789abcdef".into(),
            name: "GET /v1/test.json".into(),
            tag: None,
            state: crate::testing::TestState::Failed,
            failure_reason: Some("Bodies don't match".into()),
        };
        let line = render_summary(&summary);
        assert!(line.starts_with("01234567  failed"));
        assert!(line.ends_with("GET /v1/test.json  (Bodies don't match)"));
    }

    #[test]
    fn renders_stored_responses_as_json() {
        let response = StoredResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: json!({ "a": 1 }),
            meta: ResponseMeta {
                status: 200,
                response_time: 5,
                expected_status: None,
            },
        };
        let rendered = render_response(&response).expect("render");
        assert!(rendered.contains("\"responseTime\": 5"));
    }
}
