use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use serde::Deserialize;

use asinscout_core::{
    AsinCache, Isbn, LookupQuery, LookupResult, Resolver, ResolverConfig, TitleIndex,
};

/// asinscout - resolve retailer catalog identifiers (ASINs) for books
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the cache database (env: ASINSCOUT_CACHE)
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Run without the persistent cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// File with one known title per line, used for fuzzy query rescue
    #[arg(long, global = true)]
    title_index: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a single book
    Lookup {
        /// Book title
        #[arg(long)]
        title: Option<String>,

        /// Author name
        #[arg(long)]
        author: Option<String>,

        /// ISBN-10 or ISBN-13
        #[arg(long)]
        isbn: Option<String>,

        /// Acceptance threshold override (env: ASINSCOUT_THRESHOLD)
        #[arg(long)]
        threshold: Option<f64>,

        /// Comma-separated subset of sources to consult
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,

        /// Emit the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve queries from a file, one JSON object per line
    Batch {
        /// Input file: {"title": ..., "author": ..., "isbn": ...} per line
        file: PathBuf,

        /// Parallel worker count
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Emit results as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Entry count, file size and hit rate
    Stats,
    /// Drop every cached entry
    Clear,
    /// Delete expired rows
    Sweep,
}

/// One line of a batch file before validation.
#[derive(Deserialize)]
struct RawQuery {
    title: Option<String>,
    author: Option<String>,
    isbn: Option<String>,
}

impl RawQuery {
    fn into_query(self) -> anyhow::Result<LookupQuery> {
        let isbn = self
            .isbn
            .as_deref()
            .map(Isbn::parse)
            .transpose()
            .context("invalid ISBN")?;
        LookupQuery::new(self.title, self.author, isbn).context("invalid query")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();
    let args = Args::parse();

    // Config resolution: CLI flags > env vars > defaults
    let mut config = ResolverConfig::default();
    if let Ok(host) = std::env::var("ASINSCOUT_DOMAIN") {
        config.retailer_host = host;
    }
    if let Some(threshold) = std::env::var("ASINSCOUT_THRESHOLD")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
    {
        config.accept_threshold = threshold;
    }

    let cache_path = args
        .cache
        .clone()
        .or_else(|| std::env::var("ASINSCOUT_CACHE").ok().map(PathBuf::from))
        .unwrap_or_else(AsinCache::default_path);

    let mut resolver = Resolver::new(config);
    if !args.no_cache {
        let cache = AsinCache::open(&cache_path)
            .with_context(|| format!("opening cache at {}", cache_path.display()))?;
        resolver = resolver.with_cache(cache);
    }
    if let Some(path) = &args.title_index {
        let titles: Vec<String> = std::fs::read_to_string(path)
            .with_context(|| format!("reading title index {}", path.display()))?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        resolver = resolver.with_title_index(TitleIndex::new(titles));
    }

    match args.command {
        Command::Lookup {
            title,
            author,
            isbn,
            threshold,
            sources,
            json,
        } => {
            let isbn = isbn.as_deref().map(Isbn::parse).transpose()?;
            let query = LookupQuery::new(title, author, isbn)?;
            let source_refs: Vec<&str> = sources.iter().map(String::as_str).collect();
            let subset = (!source_refs.is_empty()).then_some(source_refs.as_slice());

            let result = resolver.lookup_with(&query, subset, threshold).await;
            print_result(&result, json)?;
            if !result.is_success() {
                std::process::exit(1);
            }
        }

        Command::Batch {
            file,
            workers,
            json,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut queries = Vec::new();
            for (lineno, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let raw: RawQuery = serde_json::from_str(line)
                    .with_context(|| format!("{}:{}", file.display(), lineno + 1))?;
                queries.push(raw.into_query()?);
            }

            let bar = ProgressBar::new_spinner().with_message(format!(
                "resolving {} queries with {} workers",
                queries.len(),
                workers
            ));
            bar.set_style(ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")?);
            bar.enable_steady_tick(Duration::from_millis(100));

            let results = resolver.lookup_batch(&queries, workers).await;
            bar.finish_and_clear();

            let mut found = 0usize;
            for result in &results {
                print_result(result, json)?;
                if result.is_success() {
                    found += 1;
                }
            }
            if !json {
                eprintln!(
                    "{} {} of {} resolved",
                    "done:".bold(),
                    found,
                    results.len()
                );
            }
        }

        Command::Cache { command } => match command {
            CacheCommand::Stats => match resolver.cache_stats() {
                Some(stats) => {
                    println!("entries:  {}", stats.entry_count);
                    println!("size:     {} bytes", stats.size_bytes);
                    println!("hit rate: {:.1}%", stats.hit_rate * 100.0);
                }
                None => anyhow::bail!("no cache configured (did you pass --no-cache?)"),
            },
            CacheCommand::Clear => {
                resolver.cache_clear()?;
                println!("cache cleared");
            }
            CacheCommand::Sweep => {
                let removed = resolver.cache_sweep()?;
                println!("{removed} expired entries removed");
            }
        },
    }

    Ok(())
}

fn print_result(result: &LookupResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    let label = result.query.describe();
    match &result.asin {
        Some(asin) => {
            let origin = if result.from_cache {
                "cache".to_string()
            } else {
                result.source.clone().unwrap_or_else(|| "?".to_string())
            };
            println!(
                "{}  {}  {}",
                asin.as_str().green().bold(),
                label,
                format!(
                    "({origin}, {:.2}, {:.0}ms)",
                    result.confidence,
                    result.elapsed.as_secs_f64() * 1000.0
                )
                .dimmed()
            );
        }
        None => {
            let detail = result.error.as_deref().unwrap_or("not found");
            println!("{}  {}  {}", "not found".red().bold(), label, detail.dimmed());
        }
    }
    Ok(())
}
