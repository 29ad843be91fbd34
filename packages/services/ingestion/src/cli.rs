use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;

use crate::clients::{create_chat_client, ChatClient};
use crate::config::Config;
use crate::context::AppContext;
use crate::handlers::{FileSpreadsheetReader, RowEvent, SpreadsheetReader};
use crate::mapping::{map_headers_with_ai, SchemaMapperFactory, MAX_SAMPLE_ROWS};
use crate::models::*;
use crate::processing::{CandidateAssembler, NormalizeOptions};
use crate::storage::{create_candidate_repository, CandidateRepository, InMemoryCandidateRepository};
use crate::sync::{CandidateImporter, ImportOptions, IngestionOrchestrator, RunOptions};
use crate::tracking::{create_status_tracker, StatusStoreKind};

#[derive(Debug, Parser)]
#[command(name = "candidate-ingestion", version, about = "Stream candidate spreadsheets into MongoDB")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Import spreadsheet files into the candidate store
    Ingest(IngestArgs),
    /// Print the AI header mapping for a file as JSON
    MapHeaders(MapHeadersArgs),
    /// Print normalized candidates for a file without persisting them
    Preview(PreviewArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Input file; may be repeated
    #[arg(long = "file")]
    pub files: Vec<String>,
    /// Directory scanned recursively for .xlsx/.xlsm/.csv/.tsv files
    #[arg(long)]
    pub dir: Option<PathBuf>,
    #[arg(long)]
    pub sheet: Option<String>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long, value_enum, default_value_t = StatusStoreKind::None)]
    pub status_store: StatusStoreKind,
    #[arg(long)]
    pub status_file: Option<PathBuf>,
    /// Re-process files already marked processed
    #[arg(long = "no-resume")]
    pub no_resume: bool,
    #[arg(long, hide = true, overrides_with = "no_resume")]
    pub resume: bool,
    #[arg(long)]
    pub fail_fast: bool,
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 1000)]
    pub retry_base_ms: u64,
    /// Ask the configured AI provider to map headers when no identity column is recognized
    #[arg(long)]
    pub ai_assist: bool,
    /// JSON object of canonicalField -> source header overrides
    #[arg(long)]
    pub mapping_file: Option<PathBuf>,
    /// Write to an in-memory store instead of MongoDB
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct MapHeadersArgs {
    #[arg(long)]
    pub file: String,
    #[arg(long)]
    pub sheet: Option<String>,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    #[arg(long)]
    pub file: String,
    #[arg(long)]
    pub sheet: Option<String>,
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
    #[arg(long)]
    pub mapping_file: Option<PathBuf>,
}

pub async fn run(cli: Cli, cfg: Config) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Ingest(args) => run_ingest(args, &cfg).await,
        Command::MapHeaders(args) => run_map_headers(args, &cfg).await,
        Command::Preview(args) => run_preview(args, &cfg).await,
    }
}

/// Reads a `{"email": "E-mail Address", ...}` dictionary.
pub fn load_mapping_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| IngestionError::Input(format!("cannot read mapping file {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| IngestionError::Input(format!("mapping file {} must be a JSON object of strings: {}", path.display(), e)))
}

fn normalize_options(cfg: &Config) -> NormalizeOptions {
    NormalizeOptions { default_country_code: cfg.default_country_code.clone() }
}

async fn run_ingest(args: IngestArgs, cfg: &Config) -> anyhow::Result<ExitCode> {
    let ctx = if args.dry_run { None } else { Some(AppContext::connect(cfg).await?) };
    let db = ctx.as_ref().map(|c| c.database());

    let repository: Arc<dyn CandidateRepository> = match db {
        Some(_) => create_candidate_repository(db, &cfg.candidates_collection),
        None => {
            tracing::info!("Dry run: writing to an in-memory store");
            Arc::new(InMemoryCandidateRepository::new())
        }
    };
    let status_file = args.status_file.clone().unwrap_or_else(|| PathBuf::from(&cfg.status_file));
    let tracker = create_status_tracker(args.status_store, status_file, db, &cfg.status_collection)?;

    let mut importer = CandidateImporter::new(
        Arc::new(FileSpreadsheetReader::new()),
        repository.clone(),
        CandidateAssembler::new(normalize_options(cfg)),
    );
    if args.ai_assist {
        let client: Arc<dyn ChatClient> = Arc::from(create_chat_client(&cfg.ai)?);
        importer = importer.with_ai_assist(client);
    }

    let dictionary = args.mapping_file.as_deref().map(load_mapping_file).transpose()?;
    let options = RunOptions {
        files: args.files,
        dir: args.dir,
        import: ImportOptions {
            sheet_name: args.sheet,
            batch_size: args.batch_size.unwrap_or(cfg.default_batch_size),
            dictionary,
        },
        resume: !args.no_resume,
        fail_fast: args.fail_fast,
        max_retries: args.max_retries,
        retry_base_ms: args.retry_base_ms,
    };

    let orchestrator = IngestionOrchestrator::new(Arc::new(importer), repository, tracker);
    let result = orchestrator.run(&options).await;
    if let Some(ctx) = ctx {
        ctx.shutdown().await;
    }
    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

async fn run_map_headers(args: MapHeadersArgs, cfg: &Config) -> anyhow::Result<ExitCode> {
    let reader = FileSpreadsheetReader::new();
    let mut stream = reader.open(Path::new(&args.file), args.sheet.as_deref()).await?;

    let mut header: Option<Vec<String>> = None;
    let mut samples = Vec::new();
    while let Some(event) = stream.next().await {
        match event? {
            RowEvent::Header { header: h, .. } => {
                if header.is_some() {
                    break;
                }
                header = Some(h.to_vec());
            }
            RowEvent::Row { record, .. } => {
                samples.push(record.to_json());
                if samples.len() >= MAX_SAMPLE_ROWS {
                    break;
                }
            }
        }
    }
    drop(stream);
    let header = header.ok_or_else(|| IngestionError::Input(format!("could not extract a header row from {}", args.file)))?;

    let client = create_chat_client(&cfg.ai)?;
    let result = map_headers_with_ai(client.as_ref(), &header, &samples).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.error.is_some() { ExitCode::from(2) } else { ExitCode::SUCCESS })
}

async fn run_preview(args: PreviewArgs, cfg: &Config) -> anyhow::Result<ExitCode> {
    let dictionary = args.mapping_file.as_deref().map(load_mapping_file).transpose()?;
    let assembler = CandidateAssembler::new(normalize_options(cfg));
    let reader = FileSpreadsheetReader::new();
    let mut stream = reader.open(Path::new(&args.file), args.sheet.as_deref()).await?;

    let mut mapper = None;
    let mut candidates = Vec::new();
    let mut dropped = 0u64;
    while let Some(event) = stream.next().await {
        match event? {
            RowEvent::Header { header, .. } => {
                let mut m = SchemaMapperFactory::create_for_header(&header);
                if let Some(dict) = &dictionary {
                    m.apply_dictionary(dict);
                }
                mapper = Some(m);
            }
            RowEvent::Row { sheet_name, row_number, record } => {
                let Some(m) = mapper.as_ref() else { continue };
                let source = SourceRef { file_path: args.file.clone(), sheet_name, row_number: row_number as i64 };
                match assembler.assemble(&m.map_row(&record), source)? {
                    Some(c) => candidates.push(c),
                    None => dropped += 1,
                }
                if candidates.len() >= args.limit {
                    break;
                }
            }
        }
    }

    let out = json!({ "filePath": args.file, "dropped": dropped, "candidates": candidates });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(ExitCode::SUCCESS)
}
