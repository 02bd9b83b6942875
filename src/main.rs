mod analytics;
mod database;
mod engine;
mod experiment;
mod filter;
mod llm;
mod rag;
mod semantic_parsing;
mod settings;
mod utils;

use std::{fs, path::Path};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    analytics::analyze,
    database::{Database, EventFilter, Movie, Submission},
    engine::QueryEngine,
    experiment::{Experiment, SessionContext},
    filter::ParsedQuery,
    rag::{RagOptions, RagPipeline},
    semantic_parsing::SemanticParser,
    settings::{Args, Command, SessionArgs, Settings},
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::from_file(args.config.as_deref()).context("Failed to load settings")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let db = Database::connect(&settings.database.path).with_context(|| {
        format!(
            "Failed to open database at {}",
            settings.database.path.display()
        )
    })?;
    let result = run(args.command, &settings, &db).await;
    db.flush()?;
    result
}

async fn run(command: Command, settings: &Settings, db: &Database) -> Result<()> {
    match command {
        Command::Import { path } => {
            let imported = db.insert_movies(read_movies(&path)?)?;
            print_json(&serde_json::json!({ "imported": imported, "total": db.movie_count() }))
        }
        Command::Genres => print_json(&db.distinct_genres()?),
        Command::Movies { ids } => print_json(&db.movies_by_ids(&ids)?),
        Command::Stats => print_json(&db.statistics()?),
        Command::Search { session, query } => {
            let query = parse_query(&query)?;
            print_json(&experiment(settings, db)?.faceted_search(&context(&session), &query)?)
        }
        Command::Parse { session, text } => {
            let preview = experiment(settings, db)?
                .assist_parse(&context(&session), &text)
                .await?;
            print_json(&preview)
        }
        Command::Execute { session, query } => {
            let query = parse_query(&query)?;
            print_json(&experiment(settings, db)?.assist_execute(&context(&session), &query)?)
        }
        Command::Ask { session, text } => {
            let answer = experiment(settings, db)?
                .llm_only_search(&context(&session), &text)
                .await?;
            print_json(&answer)
        }
        Command::StartTask { session, interface } => {
            print_json(&experiment(settings, db)?.start_task(&context(&session), interface)?)
        }
        Command::CompleteTask {
            session,
            interface,
            submission,
        } => {
            let submission: Submission =
                serde_json::from_str(&submission).context("Invalid submission JSON")?;
            let event = experiment(settings, db)?.complete_task(
                &context(&session),
                interface,
                submission,
            )?;
            print_json(&event)
        }
        Command::Log {
            session,
            interface,
            event_type,
            payload,
        } => {
            let payload = serde_json::from_str(&payload).context("Invalid payload JSON")?;
            let event = experiment(settings, db)?.log_raw(
                &context(&session),
                interface,
                &event_type,
                payload,
            )?;
            print_json(&event)
        }
        Command::Analyze {
            policy,
            participant,
            interface,
        } => {
            let filter = EventFilter {
                participant_id: participant,
                task_id: None,
                interface,
            };
            let events = db.events(&filter)?;
            let policy = policy.unwrap_or(settings.analytics.reformulation_policy);
            info!(events = events.len(), ?policy, "analyzing event log");
            print_json(&analyze(&events, policy))
        }
    }
}

fn experiment(settings: &Settings, db: &Database) -> Result<Experiment> {
    let model = llm::build_model(&settings.llm)?;
    let engine = QueryEngine::new(db.clone()).with_max_limit(settings.search.structured_limit);
    let parser = SemanticParser::new(model.clone());
    let rag = RagPipeline::new(
        parser.clone(),
        engine.clone(),
        model,
        RagOptions {
            retrieval_limit: settings.search.retrieval_limit,
            evidence_rows: settings.search.evidence_rows,
            citation_check: settings.search.citation_check,
        },
    )?;
    Ok(Experiment::new(db.clone(), engine, parser, rag))
}

fn context(session: &SessionArgs) -> SessionContext {
    SessionContext::new(&session.participant, session.task.as_deref())
}

fn parse_query(json: &str) -> Result<ParsedQuery> {
    serde_json::from_str(json).context("Invalid query JSON")
}

fn read_movies(path: &Path) -> Result<Vec<Movie>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Invalid movie list in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
