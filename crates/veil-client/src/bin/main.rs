//! veil-client binary: query a veil-server for a list of items

use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use veil_client::ClientBuilder;
use veil_client::NetworkClient;
use veil_core::{Item, LogConfig, LogLevel, MatchRecord};

#[derive(Parser, Debug)]
#[command(name = "veil-client")]
#[command(about = "Look up items in a remote SenderDB")]
struct Args {
    /// Server endpoint
    #[arg(long, default_value = "tcp://127.0.0.1:1212")]
    address: String,

    /// Parameters JSON; fetched from the server when omitted
    #[arg(long)]
    params: Option<PathBuf>,

    /// File with one item per line
    #[arg(long)]
    query_file: Option<PathBuf>,

    /// Items to look up
    items: Vec<String>,

    /// Write results as JSON to this file instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,

    /// all, debug, info, warning, error or off
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print matches only
    #[arg(long)]
    matches_only: bool,
}

#[derive(Serialize)]
struct ResultRow<'a> {
    item: &'a str,
    found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    label_hex: Option<String>,
}

impl<'a> ResultRow<'a> {
    fn new(item: &'a str, record: &MatchRecord) -> Self {
        Self {
            item,
            found: record.found,
            label: record.label_string(),
            label_hex: record.label.as_ref().map(hex::encode),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut log = LogConfig::new(args.log_level);
    if let Some(path) = &args.log_file {
        log = log.with_file(path);
    }
    log.init()?;

    let mut inputs = args.items.clone();
    if let Some(path) = &args.query_file {
        let content = std::fs::read_to_string(path)?;
        inputs.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from),
        );
    }
    if inputs.is_empty() {
        anyhow::bail!("no items to query; pass items or --query-file");
    }

    let mut builder = ClientBuilder::new(&args.address);
    if let Some(path) = &args.params {
        builder = builder.params_file(path)?;
    }
    let mut client: NetworkClient = builder.build()?;

    let items: Vec<Item> = inputs.iter().map(Item::from).collect();
    let records = client.query(&items)?;

    let traffic = client.last_traffic();
    tracing::info!(
        items = items.len(),
        found = records.iter().filter(|r| r.found).count(),
        sent = traffic.bytes_sent,
        received = traffic.bytes_received,
        "query complete"
    );

    let rows: Vec<ResultRow> = inputs
        .iter()
        .zip(&records)
        .filter(|(_, r)| r.found || !args.matches_only)
        .map(|(item, r)| ResultRow::new(item, r))
        .collect();
    let json = serde_json::to_string_pretty(&rows)?;

    match &args.out {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{}", json),
    }

    Ok(())
}
