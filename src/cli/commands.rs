//! Command handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::api::{RegistryClient, SearchFilter};
use crate::config::Settings;
use crate::pipeline::{run_embed_batch, run_fetch, run_llm_batch, run_pdf_batch, FetchRequest};
use crate::repository::{EstadoFilter, SearchFilters, SearchHit, Store};
use crate::services::embeddings::EmbeddingClient;
use crate::services::llm::{LlmClient, LlmConfig};
use crate::services::pdf::PdfProcessor;
use crate::services::search::VectorSearcher;
use crate::storage::download_stats;

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("valid spinner template"),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn open_store(settings: &Settings) -> anyhow::Result<Arc<Store>> {
    Ok(Arc::new(
        Store::new(&settings.database_path).context("failed to open database")?,
    ))
}

fn registry_client(settings: &Settings) -> anyhow::Result<RegistryClient> {
    Ok(RegistryClient::new(
        &settings.api_base_url,
        Duration::from_secs(settings.api_timeout_secs),
    )?)
}

fn embedding_client(settings: &Settings) -> anyhow::Result<EmbeddingClient> {
    let api_key = settings.require_gemini_key()?;
    Ok(EmbeddingClient::new(
        api_key,
        &settings.embedding_model,
        settings.embedding_dimensions,
    ))
}

/// Initialize the data directory, database schema and downloads tree.
pub fn init(settings: &Settings) -> anyhow::Result<()> {
    std::fs::create_dir_all(&settings.data_dir)?;
    std::fs::create_dir_all(&settings.downloads_dir)?;
    std::fs::create_dir_all(settings.markdown_dir())?;
    let _ = open_store(settings)?;

    println!("{}", style("Initialized").green().bold());
    println!("  database:  {}", settings.database_path.display());
    println!("  downloads: {}", settings.downloads_dir.display());
    Ok(())
}

/// Fire the fetch stage.
pub async fn ingest(
    settings: &Settings,
    finalidad: Option<String>,
    tipos_beneficiario: Option<String>,
    abierto: bool,
    batch_id: Option<String>,
    max_items: Option<usize>,
) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    let client = registry_client(settings)?;

    let batch_id = batch_id.unwrap_or_else(|| {
        format!(
            "batch_{}",
            &uuid::Uuid::new_v4().to_string()[..8]
        )
    });
    let request = FetchRequest {
        filter: SearchFilter {
            finalidad,
            tipos_beneficiario,
            abierto: Some(abierto),
        },
        batch_id: batch_id.clone(),
        max_items,
    };

    let bar = spinner("Fetching from the registry…");
    let stats = run_fetch(&store, &client, &request).await?;
    bar.finish_and_clear();

    println!("{} (batch {})", style("Ingest finished").green().bold(), batch_id);
    println!("  fetched:    {}", stats.fetched);
    println!("  inserted:   {}", stats.inserted);
    println!("  duplicates: {}", stats.duplicates);
    println!("  errors:     {}", stats.errors);
    Ok(())
}

/// Claim and process pending PDF tasks.
pub async fn process_pdfs(settings: &Settings, limit: u32) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    let processor = Arc::new(PdfProcessor::new(
        &settings.downloads_dir,
        settings.pdf_max_size_mib,
        Duration::from_secs(settings.api_timeout_secs),
    )?);

    let bar = spinner("Downloading and extracting PDFs…");
    let stats = run_pdf_batch(store, processor, settings, limit).await?;
    bar.finish_and_clear();
    print_stage_stats("PDF processing", &stats);
    Ok(())
}

/// Run the LLM stage over extractions needing it.
pub async fn llm(settings: &Settings, limit: u32, force: bool) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    let api_key = settings.require_gemini_key()?;
    let client = Arc::new(LlmClient::new(LlmConfig::new(api_key, &settings.llm_model)));

    let bar = spinner("Extracting fields with the LLM…");
    let stats = run_llm_batch(store, client, settings, limit, force).await?;
    bar.finish_and_clear();
    print_stage_stats("LLM extraction", &stats);
    Ok(())
}

/// Run the embed stage.
pub async fn embed(settings: &Settings, limit: u32, reprocess: bool) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    let client = Arc::new(embedding_client(settings)?);

    let bar = spinner("Generating embeddings…");
    let stats = run_embed_batch(store, client, settings, limit, reprocess).await?;
    bar.finish_and_clear();
    print_stage_stats("Embedding generation", &stats);
    Ok(())
}

/// Filter arguments of the search command.
pub struct SearchFilterArgs {
    pub organismo: Option<String>,
    pub ambito: Option<String>,
    pub finalidad: Option<String>,
    pub desde: Option<String>,
    pub hasta: Option<String>,
    pub estado: Option<String>,
}

impl SearchFilterArgs {
    fn into_filters(self) -> anyhow::Result<SearchFilters> {
        let parse_date = |raw: Option<String>, name: &str| -> anyhow::Result<Option<NaiveDate>> {
            raw.map(|raw| {
                NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                    .with_context(|| format!("invalid {name} date: {raw} (expected YYYY-MM-DD)"))
            })
            .transpose()
        };
        let estado = self
            .estado
            .map(|raw| match raw.to_lowercase().as_str() {
                "abierta" => Ok(EstadoFilter::Abierta),
                "cerrada" => Ok(EstadoFilter::Cerrada),
                "proxima" | "próxima" => Ok(EstadoFilter::Proxima),
                other => anyhow::bail!("unknown estado: {other}"),
            })
            .transpose()?;
        Ok(SearchFilters {
            organismo: self.organismo,
            ambito: self.ambito,
            finalidad: self.finalidad,
            fecha_desde: parse_date(self.desde, "desde")?,
            fecha_hasta: parse_date(self.hasta, "hasta")?,
            estado,
        })
    }
}

/// Synchronous semantic search.
pub async fn search(
    settings: &Settings,
    query: &str,
    limit: usize,
    min_similarity: f64,
    filter_args: SearchFilterArgs,
) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    let searcher = VectorSearcher::new(store, embedding_client(settings)?);
    let filters = filter_args.into_filters()?;

    let hits = searcher.search(query, limit, min_similarity, &filters).await?;
    print_hits(&hits);
    Ok(())
}

/// Grants similar to a reference grant.
pub fn similar(
    settings: &Settings,
    grant_id: i64,
    limit: usize,
    min_similarity: f64,
) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    let hits = store.find_similar(grant_id, limit, min_similarity)?;
    if hits.is_empty() {
        println!("No similar grants found (is grant {grant_id} embedded?)");
        return Ok(());
    }
    print_hits(&hits);
    Ok(())
}

/// Counts by entity and status plus index readiness.
pub fn stats(settings: &Settings) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    let stats = store.pipeline_stats()?;
    let (pdf_count, pdf_bytes) = download_stats(&settings.downloads_dir);

    println!("{}", style("Pipeline").bold());
    if stats.staging_by_status.is_empty() {
        println!("  staging: empty");
    }
    for (status, count) in &stats.staging_by_status {
        println!("  staging/{status}: {count}");
    }
    println!("  grants:      {}", stats.grants);
    println!("  extractions: {} ({} with errors)", stats.extractions, stats.extraction_errors);
    println!("  embeddings:  {}", stats.embeddings);

    println!("{}", style("Downloads").bold());
    println!("  files: {pdf_count} ({:.1} MiB)", pdf_bytes as f64 / (1024.0 * 1024.0));

    println!("{}", style("Search").bold());
    println!("  vectors:     {}", stats.search.total_embeddings);
    println!("  avg dims:    {:.0}", stats.search.avg_dimensions);
    println!(
        "  ready:       {}",
        if stats.search.search_ready { "yes" } else { "no" }
    );

    let failed = store.failed_items(10)?;
    if !failed.is_empty() {
        println!("{}", style("Recent failures").bold());
        for item in failed {
            println!(
                "  {} [{}]: {}",
                item.external_id,
                item.last_stage.map(|s| s.as_str()).unwrap_or("-"),
                item.error_message.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

/// Human-driven requeue of terminal items.
pub fn requeue(
    settings: &Settings,
    external_id: Option<String>,
    all_failed: bool,
) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    match (external_id, all_failed) {
        (Some(external_id), _) => {
            if store.requeue(&external_id)? {
                println!("Requeued {external_id}");
            } else {
                println!("{external_id} is not in a terminal state, nothing to do");
            }
        }
        (None, true) => {
            let count = store.requeue_failed()?;
            println!("Requeued {count} failed items");
        }
        (None, false) => {
            anyhow::bail!("pass an external id or --all-failed");
        }
    }
    Ok(())
}

fn print_stage_stats(label: &str, stats: &crate::pipeline::StageStats) {
    println!("{}", style(label).green().bold());
    println!("  processed: {}", stats.processed);
    println!("  completed: {}", stats.completed);
    println!("  skipped:   {}", stats.skipped);
    println!("  failed:    {}", stats.failed);
}

fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results");
        return;
    }
    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{} {} {}",
            style(format!("{}.", rank + 1)).dim(),
            style(format!("[{:.4}]", hit.similarity)).cyan(),
            hit.titulo.as_deref().unwrap_or("(sin título)")
        );
        if let Some(organismo) = &hit.organismo {
            println!("   {organismo}");
        }
        let window = match (hit.fecha_inicio_solicitud, hit.fecha_fin_solicitud) {
            (Some(inicio), Some(fin)) => format!("{inicio} a {fin}"),
            (_, Some(fin)) => format!("hasta {fin}"),
            _ => String::new(),
        };
        if !window.is_empty() {
            println!("   solicitud: {window}");
        }
        if let Some(summary) = &hit.summary {
            let preview: String = summary.chars().take(160).collect();
            println!("   {}", style(preview).dim());
        }
        println!("   grant={} external={}", hit.grant_id, hit.external_id);
    }
}
