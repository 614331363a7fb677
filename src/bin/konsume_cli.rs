//! Minimal CLI around the `konsume` consumer subsystem: point it at a broker
//! and a topic (or a regex) and it prints records as they arrive.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use konsume::{Client, Config, OffsetSpec};

#[derive(Parser, Debug)]
#[command(name = "konsume-cli")]
#[command(about = "Tail Kafka topics using the konsume consumer subsystem", long_about = None)]
struct Args {
    /// Kafka broker address
    #[arg(short, long, default_value = "localhost:9092")]
    broker: String,

    /// Topic to consume (required unless --regex is provided)
    #[arg(short, long, required_unless_present = "regex")]
    topic: Option<String>,

    /// Regex over topic names, consumed instead of a single --topic
    #[arg(long, conflicts_with = "topic")]
    regex: Option<String>,

    /// Specific partition to read from (default: all partitions of --topic)
    #[arg(short, long)]
    partition: Option<i32>,

    /// Starting offset: "earliest" | "latest" | <number>
    #[arg(short, long, default_value = "latest")]
    offset: String,

    /// Join a consumer group instead of direct assignment
    #[arg(long)]
    group: Option<String>,

    /// How long each poll waits for data before printing nothing
    #[arg(long, default_value_t = 1000)]
    poll_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let offset_spec = parse_offset(&args.offset)?;

    let mut builder = Config::builder(&args.broker).auto_offset_reset(offset_spec);
    if let Some(group) = &args.group {
        builder = builder.consumer_group(group.clone());
    }
    let config = builder.build();

    let client = Client::new(config).context("failed to set up Kafka transport")?;

    if let Some(pattern) = &args.regex {
        client.consume_regex(pattern).await.context("invalid --regex pattern")?;
    } else {
        let topic = args.topic.clone().expect("clap guarantees --topic or --regex");
        match args.partition {
            Some(partition) => {
                let mut partitions = HashMap::new();
                partitions.insert(partition, offset_spec);
                let mut spec = HashMap::new();
                spec.insert(topic, partitions);
                client.add_consume_partitions(spec);
            },
            None => {
                client.add_consume_topics([topic]).await;
            },
        }
    }

    eprintln!("tailing {}...", args.broker);
    let poll_timeout = Duration::from_millis(args.poll_timeout_ms);
    loop {
        let fetches = client.poll_fetches(poll_timeout).await;
        fetches.each_record(|tp, record| {
            let key = record.key.as_deref().map(String::from_utf8_lossy);
            let value = record.value.as_deref().map(String::from_utf8_lossy);
            println!("{tp} offset={} key={key:?} value={value:?}", record.offset);
        });
        fetches.each_error(|tp, err| {
            eprintln!("{tp}: {err}");
        });
    }
}

fn parse_offset(s: &str) -> Result<OffsetSpec> {
    match s {
        "earliest" | "beginning" => Ok(OffsetSpec::Earliest),
        "latest" | "end" => Ok(OffsetSpec::Latest),
        other => other
            .parse::<i64>()
            .map(OffsetSpec::Literal)
            .with_context(|| format!("invalid --offset value: {other}")),
    }
}
