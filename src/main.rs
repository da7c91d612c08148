//! `llpg-match` — matches historic planning/building-control documents
//! against an authoritative LLPG gazetteer and records UPRN linkages.

mod candidates;
mod config;
mod decision;
mod domain;
mod error;
mod features;
mod normalise;
mod phonetic;
mod pipeline;
mod rules;
mod similarity;
mod store;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use candidates::CandidateGenerator;
use config::Config;
use decision::decide;
use domain::{Address, MatchRun, SourceDocument, Status};
use error::MatchEngineError;
use normalise::Normaliser;
use pipeline::{CancellationToken, Layer, Pipeline};
use rules::RuleSet;
use store::{EmbeddingService, NullEmbeddingService, NullVectorStore, RelationalStore, SqliteStore, VectorStore};

#[derive(Parser)]
#[command(
    name = "llpg-match",
    version,
    about = "Matches historic document addresses against an authoritative LLPG gazetteer",
    long_about = "Normalises incoming addresses, generates candidate UPRN matches across \
                  deterministic, fuzzy, semantic, and spatial tiers, scores them, and records \
                  the decision trail for audit."
)]
struct Cli {
    /// Path to the SQLite database. Overrides the config file's `store.database_path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to a TOML config file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database file and schema if they don't already exist.
    SetupDb,

    /// Load gazetteer rows from a CSV file into the `address` table.
    LoadLlpg {
        /// CSV with columns: uprn, full_address, postcode, usrn, blpu_class, status, easting, northing.
        path: PathBuf,
    },

    /// Load one or more source-document CSVs into `src_document`.
    LoadSources {
        /// CSVs with columns: raw_address, postcode, raw_uprn, raw_easting, raw_northing, external_reference, doc_date.
        paths: Vec<PathBuf>,

        /// Source type recorded for every row loaded by this invocation.
        #[arg(long, default_value = "planning")]
        source_type: String,
    },

    /// Run the matching pipeline.
    Match {
        #[command(subcommand)]
        mode: MatchMode,
    },

    /// Print run-level totals.
    Stats {
        run_id: i64,
    },

    /// Export accepted/reviewed/rejected matches as CSV.
    Export {
        dir: PathBuf,

        /// Only export rows with this decision (auto_accepted, needs_review, rejected).
        #[arg(long)]
        decision: Option<String>,
    },
}

#[derive(Subcommand)]
enum MatchMode {
    /// Run layers 2-5 in sequence, carrying unmatched documents forward.
    Comprehensive,
    /// Layer 2: Tier A only.
    Deterministic,
    /// Layer 3: full tier cascade, grouped by canonical address.
    FuzzyGroup,
    /// Layer 4: full tier cascade, one document at a time.
    FuzzyIndividual,
    /// Layer 5: full tier cascade with stricter acceptance thresholds.
    Conservative,
    /// Match a single address supplied on the command line; nothing is persisted.
    Single {
        #[arg(long)]
        address: String,
        #[arg(long)]
        postcode: Option<String>,
        #[arg(long)]
        uprn: Option<String>,
        #[arg(long)]
        easting: Option<f64>,
        #[arg(long)]
        northing: Option<f64>,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:?}");
            let code = match e.downcast_ref::<MatchEngineError>() {
                Some(MatchEngineError::Configuration(_)) => 3,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "llpg_match=info",
        1 => "llpg_match=debug",
        _ => "llpg_match=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(db) = &cli.db {
        config.store.database_path = db.clone();
    }

    match cli.command {
        Commands::SetupDb => {
            SqliteStore::open(&config.store.database_path, config.runtime.max_retries)
                .context("creating database")?;
            info!(path = %config.store.database_path.display(), "database ready");
            Ok(0)
        }

        Commands::LoadLlpg { path } => {
            let store = open_store(&config)?;
            let rules = RuleSet::default();
            let n = load_llpg(&store, &rules, &path)?;
            info!(count = n, "gazetteer rows loaded");
            Ok(0)
        }

        Commands::LoadSources { paths, source_type } => {
            let store = open_store(&config)?;
            let rules = RuleSet::default();
            let mut total = 0usize;
            for path in &paths {
                total += load_sources(&store, &rules, path, &source_type)?;
            }
            info!(count = total, "source documents loaded");
            Ok(0)
        }

        Commands::Match { mode } => run_match(&config, mode),

        Commands::Stats { run_id } => {
            let store = open_store(&config)?;
            let (processed, accepted, review, rejected) =
                store.run_totals(run_id).context("reading run totals")?;
            println!("run {run_id}");
            println!("  processed: {processed}");
            println!("  accepted:  {accepted}");
            println!("  review:    {review}");
            println!("  rejected:  {rejected}");
            Ok(0)
        }

        Commands::Export { dir, decision } => {
            let store = open_store(&config)?;
            export(&store, &dir, decision.as_deref())?;
            Ok(0)
        }
    }
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&config.store.database_path, config.runtime.max_retries).context("opening database")
}

fn next_run_id() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn run_match(config: &Config, mode: MatchMode) -> Result<i32> {
    let store = open_store(config)?;
    let rules = RuleSet::default();

    if let MatchMode::Single {
        address,
        postcode,
        uprn,
        easting,
        northing,
    } = mode
    {
        return match_single(&store, &rules, config, &address, postcode, uprn, easting, northing);
    }

    let vector_store: Box<dyn VectorStore> = Box::new(NullVectorStore);
    let embedder: Box<dyn EmbeddingService> = Box::new(NullEmbeddingService);

    let run_id = next_run_id();
    let mut run = MatchRun::new(run_id, label_for(&mode), decision::decided_at());
    store.insert_match_run(&run).context("recording match run")?;
    store.snapshot_rules(&rules).context("snapshotting rule set")?;

    let pipeline = Pipeline {
        store: &store,
        vector_store: vector_store.as_ref(),
        embedder: embedder.as_ref(),
        rules: &rules,
        config,
    };
    let cancellation = CancellationToken::new();

    let pending = store.list_pending_documents().context("listing pending documents")?;
    info!(count = pending.len(), "documents queued for matching");

    match mode {
        MatchMode::Deterministic => {
            pipeline.run_layer(&mut run, Layer::Deterministic, pending, &cancellation)?;
        }
        MatchMode::FuzzyGroup => {
            pipeline.run_layer(&mut run, Layer::FuzzyGroup, pending, &cancellation)?;
        }
        MatchMode::FuzzyIndividual => {
            pipeline.run_layer(&mut run, Layer::FuzzyIndividual, pending, &cancellation)?;
        }
        MatchMode::Conservative => {
            pipeline.run_layer(&mut run, Layer::Conservative, pending, &cancellation)?;
        }
        MatchMode::Comprehensive => {
            let remaining = pipeline.run_layer(&mut run, Layer::Deterministic, pending, &cancellation)?;
            let docs = store.list_documents(&remaining)?;
            let remaining = pipeline.run_layer(&mut run, Layer::FuzzyGroup, docs, &cancellation)?;
            let docs = store.list_documents(&remaining)?;
            let remaining = pipeline.run_layer(&mut run, Layer::FuzzyIndividual, docs, &cancellation)?;
            let docs = store.list_documents(&remaining)?;
            pipeline.run_layer(&mut run, Layer::Conservative, docs, &cancellation)?;
        }
        MatchMode::Single { .. } => unreachable!("handled above"),
    }

    run.completed_at = Some(decision::decided_at());
    store.complete_match_run(&run).context("completing match run")?;

    println!("run {run_id}: processed={} accepted={} review={} rejected={} errored={}",
        run.processed, run.accepted, run.review, run.rejected, run.errored);

    if run.errored > 0 {
        warn!(errored = run.errored, "some documents failed to process");
        Ok(4)
    } else {
        Ok(0)
    }
}

fn label_for(mode: &MatchMode) -> &'static str {
    match mode {
        MatchMode::Comprehensive => "comprehensive",
        MatchMode::Deterministic => "deterministic",
        MatchMode::FuzzyGroup => "fuzzy_group",
        MatchMode::FuzzyIndividual => "fuzzy_individual",
        MatchMode::Conservative => "conservative",
        MatchMode::Single { .. } => "single",
    }
}

#[allow(clippy::too_many_arguments)]
fn match_single(
    store: &SqliteStore,
    rules: &RuleSet,
    config: &Config,
    address: &str,
    postcode: Option<String>,
    uprn: Option<String>,
    easting: Option<f64>,
    northing: Option<f64>,
) -> Result<i32> {
    let normaliser = Normaliser::new(rules);
    let norm = normaliser.normalise(address)?;

    let doc = SourceDocument {
        src_id: 0,
        source_type: "adhoc".to_string(),
        raw_address: address.to_string(),
        canonical: norm.canonical,
        postcode: postcode.or(norm.postcode),
        raw_uprn: uprn,
        raw_easting: easting,
        raw_northing: northing,
        external_reference: None,
        doc_date: None,
    };

    let vector_store = NullVectorStore;
    let embedder = NullEmbeddingService;
    let generator = CandidateGenerator {
        store,
        vector_store: &vector_store,
        embedder: &embedder,
        rules,
        thresholds: &config.thresholds,
        weights: &config.weights,
        collaborators: &config.collaborators,
    };

    let candidates = generator.generate(&doc, false)?;
    let outcome = decide(&candidates, &config.thresholds);

    println!("decision: {}", outcome.decision.as_str());
    for r in outcome.results.iter().take(3) {
        println!("  [{}] {} method={} score={:.4}", r.tie_rank, r.uprn, r.method, r.score);
    }
    if let Some(uprn) = &outcome.accepted_uprn {
        println!("accepted: {uprn}");
    }

    Ok(0)
}

fn load_llpg(store: &SqliteStore, rules: &RuleSet, path: &std::path::Path) -> Result<usize> {
    let normaliser = Normaliser::new(rules);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let idx = |name: &str| find_column(&headers, name);
    let uprn_i = idx("uprn").context("missing uprn column")?;
    let addr_i = idx("full_address").context("missing full_address column")?;
    let postcode_i = idx("postcode");
    let usrn_i = idx("usrn");
    let blpu_i = idx("blpu_class");
    let status_i = idx("status");
    let easting_i = idx("easting");
    let northing_i = idx("northing");

    let mut count = 0usize;
    for record in reader.records() {
        let record = record?;
        let uprn = record.get(uprn_i).unwrap_or("").trim().to_string();
        let full_address = record.get(addr_i).unwrap_or("").trim().to_string();
        if uprn.is_empty() || full_address.is_empty() {
            continue;
        }
        let canonical = normaliser.normalise(&full_address)?.canonical;
        let status = status_i
            .and_then(|i| record.get(i))
            .and_then(Status::parse)
            .unwrap_or(Status::Live);

        let address = Address {
            uprn,
            full_address,
            canonical,
            postcode: postcode_i
                .and_then(|i| record.get(i))
                .filter(|s| !s.is_empty())
                .map(normalise_postcode),
            usrn: usrn_i.and_then(|i| record.get(i)).filter(|s| !s.is_empty()).map(str::to_string),
            blpu_class: blpu_i.and_then(|i| record.get(i)).filter(|s| !s.is_empty()).map(str::to_string),
            status,
            easting: easting_i.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            northing: northing_i.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
        };
        store.insert_address(&address)?;
        count += 1;
    }
    Ok(count)
}

fn load_sources(
    store: &SqliteStore,
    rules: &RuleSet,
    path: &std::path::Path,
    default_source_type: &str,
) -> Result<usize> {
    let normaliser = Normaliser::new(rules);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let idx = |name: &str| find_column(&headers, name);
    let addr_i = idx("raw_address").context("missing raw_address column")?;
    let source_type_i = idx("source_type");
    let postcode_i = idx("postcode");
    let uprn_i = idx("raw_uprn");
    let easting_i = idx("raw_easting");
    let northing_i = idx("raw_northing");
    let ref_i = idx("external_reference");
    let date_i = idx("doc_date");

    let mut count = 0usize;
    for record in reader.records() {
        let record = record?;
        let raw_address = record.get(addr_i).unwrap_or("").trim().to_string();
        if raw_address.is_empty() {
            continue;
        }
        let norm = match normaliser.normalise(&raw_address) {
            Ok(n) => n,
            Err(e) => {
                warn!(address = %raw_address, error = %e, "skipping unnormalisable row");
                continue;
            }
        };
        let doc = SourceDocument {
            src_id: 0,
            source_type: source_type_i
                .and_then(|i| record.get(i))
                .filter(|s| !s.is_empty())
                .unwrap_or(default_source_type)
                .to_string(),
            raw_address,
            canonical: norm.canonical,
            postcode: postcode_i.and_then(|i| record.get(i)).filter(|s| !s.is_empty()).map(str::to_string).or(norm.postcode),
            raw_uprn: uprn_i.and_then(|i| record.get(i)).filter(|s| !s.is_empty()).map(str::to_string),
            raw_easting: easting_i.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            raw_northing: northing_i.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            external_reference: ref_i.and_then(|i| record.get(i)).filter(|s| !s.is_empty()).map(str::to_string),
            doc_date: date_i
                .and_then(|i| record.get(i))
                .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        };
        store.insert_source_document(&doc)?;
        count += 1;
    }
    Ok(count)
}

fn find_column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.eq_ignore_ascii_case(name))
}

/// Matches the normalised form `Normaliser` produces for postcodes extracted
/// from free text (spec.md §3: `Address.postcode` is "normalised,
/// space-stripped") so a gazetteer's own postcode column round-trips the
/// same way.
fn normalise_postcode(s: &str) -> String {
    s.trim().to_uppercase().replace(' ', "")
}

fn export(store: &SqliteStore, dir: &std::path::Path, decision_filter: Option<&str>) -> Result<()> {
    std::fs::create_dir_all(dir).context("creating export directory")?;
    let path = dir.join("matches.csv");
    let mut writer = csv::Writer::from_path(&path).with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(["src_id", "candidate_uprn", "method", "score", "decision", "tie_rank", "decided_at"])?;

    // The relational store only exposes per-document and per-uprn lookups
    // (spec.md §6); a full export walks every pending-or-matched document's
    // top candidate rows rather than requiring a bespoke report query.
    let mut src_ids: Vec<i64> = store
        .list_all_documents()?
        .iter()
        .map(|d| d.src_id)
        .collect();
    src_ids.sort_unstable();
    src_ids.dedup();

    let mut written = 0usize;
    for src_id in src_ids {
        for result in store.top_candidates(src_id, 3)? {
            if let Some(filter) = decision_filter {
                if result.decision.as_str() != filter {
                    continue;
                }
            }
            writer.write_record([
                result.src_id.to_string(),
                result.candidate_uprn,
                result.method.as_str().to_string(),
                format!("{:.4}", result.score),
                result.decision.as_str().to_string(),
                result.tie_rank.to_string(),
                result.decided_at.to_rfc3339(),
            ])?;
            written += 1;
        }
    }
    writer.flush()?;
    info!(path = %path.display(), rows = written, "export written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_postcode_uppercases_and_strips_spaces() {
        assert_eq!(normalise_postcode("gu34 1aa"), "GU341AA");
        assert_eq!(normalise_postcode(" GU34 1AA "), "GU341AA");
    }
}
