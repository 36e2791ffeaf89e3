//! corpus-rag CLI.
//!
//! - `crag init` — create the database schema and seed built-in templates
//! - `crag serve` — start the HTTP server
//! - `crag ask <question>` — run the whole pipeline end to end
//! - `crag query show|list` — inspect persisted queries
//! - `crag template list|show|set-active` — manage prompt templates

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use corpus_rag::{
    augment, config, consolidate, db, embed_query, embedding, expand, generation, migrate,
    query_store, rerank, retrieve, server, templates,
};

#[derive(Parser)]
#[command(
    name = "crag",
    about = "corpus-rag — a retrieval-augmented generation backend for curated academic corpora",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/crag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and seed built-in prompt templates
    Init,

    /// Start the HTTP server
    Serve,

    /// Run the full pipeline for one question and print the answer
    Ask {
        /// The question to answer
        question: String,

        /// Number of context groups to include in the prompt
        #[arg(long)]
        top_n: Option<usize>,

        /// Use the FULL generative model tier
        #[arg(long)]
        full_model: bool,
    },

    /// Inspect persisted queries
    Query {
        #[command(subcommand)]
        action: QueryAction,
    },

    /// Manage prompt templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
}

#[derive(Subcommand)]
enum QueryAction {
    /// Show one query by id
    Show { id: String },

    /// List recent queries
    List {
        /// Maximum number of queries to list
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// List all template versions
    List,

    /// Show the active template for a function tag
    Show { function_tag: String },

    /// Activate a specific version of a function tag
    SetActive { function_tag: String, version: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ask {
            question,
            top_n,
            full_model,
        } => {
            run_ask(&cfg, &question, top_n, full_model).await?;
        }
        Commands::Query { action } => match action {
            QueryAction::Show { id } => {
                let pool = db::connect(&cfg).await?;
                let query = query_store::get_query(&pool, &id).await?;
                let results = query_store::list_results(&pool, &id).await?;
                pool.close().await;
                print_query(&query, &results);
            }
            QueryAction::List { limit } => {
                let pool = db::connect(&cfg).await?;
                let queries = query_store::list_queries(&pool, limit).await?;
                pool.close().await;
                for query in &queries {
                    println!(
                        "{}  [{}/{}]  {}",
                        query.id,
                        query.state.as_str(),
                        query.vector_status.as_str(),
                        query.original_query
                    );
                }
                if queries.is_empty() {
                    println!("No queries.");
                }
            }
        },
        Commands::Template { action } => match action {
            TemplateAction::List => {
                let pool = db::connect(&cfg).await?;
                let all = templates::list(&pool).await?;
                pool.close().await;
                for template in &all {
                    println!(
                        "{} v{} {} {}",
                        template.function_tag,
                        template.version,
                        if template.is_active { "[active]" } else { "        " },
                        template.title
                    );
                }
            }
            TemplateAction::Show { function_tag } => {
                let pool = db::connect(&cfg).await?;
                let content = templates::resolve(&pool, &function_tag).await?;
                pool.close().await;
                println!("{}", content);
            }
            TemplateAction::SetActive {
                function_tag,
                version,
            } => {
                let pool = db::connect(&cfg).await?;
                templates::set_active(&pool, &function_tag, version).await?;
                pool.close().await;
                println!("{} v{} is now active.", function_tag, version);
            }
        },
    }

    Ok(())
}

/// Drive every pipeline stage in order for one question.
async fn run_ask(
    cfg: &config::Config,
    question: &str,
    top_n: Option<usize>,
    full_model: bool,
) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let generator = generation::create_generator(&cfg.generation)?;
    let embedder = embedding::create_embedder(&cfg.embedding)?;
    let rerank_model = rerank::create_rerank_model(&cfg.rerank)?;

    let query = expand::run_expansion(
        &pool,
        generator.as_ref(),
        &cfg.generation,
        question,
        full_model,
    )
    .await?;
    println!("query: {}", query.id);
    println!(
        "  expanded: {} variants, intent {}, {} entities{}",
        query.expanded_queries.len(),
        query.intent.as_str(),
        query.entities.len(),
        if query.parse_warning {
            " (parse warning)"
        } else {
            ""
        }
    );

    let status = embed_query::run_embed(&pool, embedder.as_ref(), &query.id).await?;
    println!("  embedded: {}", status.as_str());

    let retrieved = retrieve::run_retrieve(
        &pool,
        rerank_model.as_deref(),
        &cfg.retrieval,
        &query.id,
    )
    .await?;
    println!("  retrieved: {} chunks", retrieved);

    if retrieved == 0 {
        println!("No candidates found; nothing to answer from.");
        pool.close().await;
        return Ok(());
    }

    let outcome = consolidate::run_consolidate(&pool, &cfg.retrieval, &query.id).await?;
    println!(
        "  consolidated: {} -> {} groups{}",
        outcome.original_count,
        outcome.consolidated_count,
        if outcome.stale_warning {
            " (stale source fallback)"
        } else {
            ""
        }
    );

    let record = augment::run_answer(
        &pool,
        generator.as_ref(),
        &cfg.generation,
        &cfg.retrieval,
        &query.id,
        top_n,
        full_model,
    )
    .await?;
    pool.close().await;

    println!();
    println!("{}", record.response_text);
    Ok(())
}

fn print_query(query: &corpus_rag::models::Query, results: &[corpus_rag::models::ResultRecord]) {
    println!("--- Query ---");
    println!("id:            {}", query.id);
    println!("question:      {}", query.original_query);
    println!("state:         {}", query.state.as_str());
    println!("vector_status: {}", query.vector_status.as_str());
    println!("intent:        {}", query.intent.as_str());
    println!("entities:      {}", query.entities.join(", "));
    if query.parse_warning {
        println!("warning:       expansion response did not parse");
    }
    println!();

    if !query.expanded_queries.is_empty() {
        println!("--- Expansions ---");
        for expansion in &query.expanded_queries {
            println!("- {}", expansion);
        }
        println!();
    }

    if !query.hyde_answer.is_empty() {
        println!("--- HyDE ---");
        println!("{}", query.hyde_answer);
        println!();
    }

    if !query.retrieved_context.is_empty() {
        println!("--- Retrieved ({}) ---", query.retrieved_context.len());
        for chunk in &query.retrieved_context {
            println!(
                "[{:.4}] {} lines {}-{} (rrf {:.4}, rerank {:.4}, entity {:.2})",
                chunk.final_score,
                chunk.chunk_id,
                chunk.start_line,
                chunk.end_line,
                chunk.rrf_score,
                chunk.rerank_score,
                chunk.entity_boost
            );
        }
        println!();
    }

    if !query.clean_retrieval_context.is_empty() {
        println!(
            "--- Consolidated ({}) ---",
            query.clean_retrieval_context.len()
        );
        for group in &query.clean_retrieval_context {
            println!(
                "[{:.4}] {} chunks, lines {}-{}, {}",
                group.score,
                group.chunk_ids.len(),
                group.start_line,
                group.end_line,
                group.heading_chain.join(" > ")
            );
        }
        println!();
    }

    println!("--- Results ({}) ---", results.len());
    for record in results {
        println!("[{}]", record.id);
        println!("{}", record.response_text);
        println!();
    }
}
