//! Lessoncast CLI - Lesson to Podcast Tool
//!
//! A command-line tool for turning lesson pages into two-speaker audio episodes.

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use lessoncast_core::{
    Config, DedupDecision, Deduplicator, DialogueChunker, DialogueScript, Document,
    GeminiSynthesisEngine, JsonManifestStore, OpenAiScriptRenderer, Pipeline, PipelineCallback,
    PipelineEvent, ScriptRenderer, StaticScriptRenderer, chunker::total_duration,
    config::default_config, dedup::render_for_prompt, script::speakers_from_config,
};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "lessoncast",
    version,
    about = "Lesson to Podcast Tool - Turn lessons into two-speaker audio",
    long_about = "A CLI tool that deduplicates lesson text, renders it as a dialogue with an \
                  OpenAI-compatible model and synthesizes it with a multi-speaker TTS API."
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate audio for one or more lesson files
    Generate {
        /// Markdown lesson files
        #[arg(value_name = "FILES", required = true)]
        files: Vec<PathBuf>,

        /// Directory for generated audio
        #[arg(short, long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Manifest file to merge results into
        #[arg(short, long, value_name = "FILE")]
        manifest: Option<PathBuf>,

        /// Use a pre-written `Name: text` script instead of the language model
        #[arg(long, value_name = "FILE")]
        script: Option<PathBuf>,

        /// Chunks synthesized in parallel
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,

        /// Keep WAV output even if the config enables MP3
        #[arg(long)]
        no_transcode: bool,
    },

    /// Show what deduplication does to a lesson
    Dedup {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Show how a dialogue script would be chunked
    Plan {
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,
    },

    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => {
            let config = Config::load(path)?;
            debug!(path = %path.display(), "configuration loaded");
            config
        }
        None => Config::default(),
    };

    match cli.command {
        Command::Generate {
            files,
            output_dir,
            manifest,
            script,
            concurrency,
            no_transcode,
        } => {
            let mut config = config;
            if let Some(dir) = output_dir {
                config.output.directory = dir;
            }
            if let Some(path) = manifest {
                config.output.manifest = path;
            }
            if let Some(n) = concurrency {
                config.synthesis.concurrency = n;
            }
            if no_transcode {
                config.output.transcode = false;
            }
            config.validate()?;
            generate(config, &files, script.as_deref()).await
        }
        Command::Dedup { file } => dedup(&config, &file),
        Command::Plan { script } => plan(&config, &script),
        Command::Config => {
            print!("{}", default_config().to_toml()?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Document ids for `paths`: each file relative to the deepest directory
/// holding all of them, without extension and `/`-separated. A lone
/// `docs/ownership.md` is `ownership`; `docs/a/intro.md` next to
/// `docs/b/intro.md` gives `a/intro` and `b/intro`.
fn document_ids(paths: &[PathBuf]) -> Vec<String> {
    let resolved: Vec<PathBuf> = paths
        .iter()
        .map(|p| {
            fs::canonicalize(p)
                .or_else(|_| std::path::absolute(p))
                .unwrap_or_else(|_| p.clone())
        })
        .collect();

    let mut root: Option<PathBuf> = None;
    for path in &resolved {
        let parent = path.parent().unwrap_or(Path::new(""));
        root = Some(match root {
            None => parent.to_path_buf(),
            Some(current) => current
                .components()
                .zip(parent.components())
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a)
                .collect(),
        });
    }
    let root = root.unwrap_or_default();

    resolved
        .iter()
        .map(|path| {
            let relative = path.strip_prefix(&root).unwrap_or(path).with_extension("");
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if id.is_empty() {
                path.display().to_string()
            } else {
                id
            }
        })
        .collect()
}

fn read_document(path: &Path, id: String) -> Result<Document, Box<dyn std::error::Error>> {
    let source = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    Ok(Document::from_markdown(id, &source))
}

async fn generate(
    config: Config,
    files: &[PathBuf],
    script: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let ids = document_ids(files);
    let mut seen = HashSet::new();
    if let Some(duplicate) = ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(format!("two input files map to the same document id '{}'", duplicate).into());
    }
    let documents = files
        .iter()
        .zip(ids)
        .map(|(path, id)| read_document(path, id))
        .collect::<Result<Vec<_>, _>>()?;

    let renderer: Arc<dyn ScriptRenderer> = match script {
        Some(path) => Arc::new(StaticScriptRenderer::new(fs::read_to_string(path)?)),
        None => {
            let mut llm = config.llm.clone();
            if let Ok(base) = env::var("OPENAI_API_BASE").or_else(|_| env::var("OPENAI_BASE_URL")) {
                llm.api_base = base;
            }
            let api_key = env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
                eprintln!(
                    "{}",
                    "Warning: OPENAI_API_KEY not set. API calls may fail.".yellow()
                );
                String::new()
            });
            Arc::new(OpenAiScriptRenderer::new(llm, &api_key)?)
        }
    };

    let tts_key = env::var("GEMINI_API_KEY").unwrap_or_else(|_| {
        eprintln!(
            "{}",
            "Warning: GEMINI_API_KEY not set. Synthesis calls may fail.".yellow()
        );
        String::new()
    });
    let engine = Arc::new(GeminiSynthesisEngine::new(&config.synthesis, tts_key)?);
    let store = JsonManifestStore::new(&config.output.manifest);

    // Print header
    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!("{}", format!("  {}", "Lessoncast".bold()).bright_blue().bold());
    println!("{}", "═".repeat(70).bright_blue());
    println!();
    println!(
        "{} {} ({}) & {} ({})",
        "Speakers:".bold(),
        config.voices.host.name.bright_cyan(),
        config.voices.host.voice.dimmed(),
        config.voices.guest.name.bright_cyan(),
        config.voices.guest.voice.dimmed()
    );
    println!("{} {}", "Output:".bold(), config.output.directory.display());
    println!("{}", "─".repeat(70).dimmed());

    let pipeline = Pipeline::new(config, renderer, engine).with_callback(create_console_callback());
    let report = pipeline.run(&documents, &store).await?;

    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!(
        "{}",
        format!(
            "  {} generated, {} failed ({} replaced)",
            report.generated.len(),
            report.failed.len(),
            report.replaced
        )
        .bright_green()
        .bold()
    );
    for failure in &report.failed {
        println!("  {} {}: {}", "✗".red(), failure.id.bold(), failure.error);
    }
    println!("{}", "═".repeat(70).bright_blue());
    println!();

    if report.is_success() {
        Ok(())
    } else {
        Err(format!("{} document(s) failed", report.failed.len()).into())
    }
}

fn dedup(config: &Config, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let id = document_ids(&[file.to_path_buf()])
        .into_iter()
        .next()
        .unwrap_or_default();
    let document = read_document(file, id)?;
    let outcome = Deduplicator::new(config.dedup.clone()).run(&document);

    for record in &outcome.decisions {
        let decision = match &record.decision {
            DedupDecision::Remove => "remove".red(),
            DedupDecision::Condense(_) => "condense".yellow(),
            DedupDecision::Keep => "keep".green(),
        };
        println!(
            "  block {:>3} {:<10} score {:.3} -> {}",
            record.position,
            record.label.dimmed(),
            record.score,
            decision
        );
    }

    let stats = &outcome.stats;
    println!();
    println!(
        "{} {} removed, {} condensed, {} kept; {} -> {} chars",
        "Dedup:".bold(),
        stats.removed,
        stats.condensed,
        stats.kept,
        stats.chars_before,
        stats.chars_after
    );
    println!("{}", "─".repeat(70).dimmed());
    println!("{}", render_for_prompt(&outcome.document));
    Ok(())
}

fn plan(config: &Config, script: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(script)?;
    let script = DialogueScript::parse(speakers_from_config(&config.voices), &text)?;
    let chunker = DialogueChunker::from_config(&config.chunking);
    let chunks = chunker.chunk(&script);

    for chunk in &chunks {
        println!(
            "  chunk {:>3}: {:>3} utterances, {:>6} chars, ~{:.0}s",
            chunk.index,
            chunk.utterances.len(),
            chunk.char_count(),
            chunk.estimated_duration.as_secs_f64()
        );
    }
    println!(
        "{} {} chunks, ~{:.1} min",
        "Plan:".bold(),
        chunks.len(),
        total_duration(&chunks).as_secs_f64() / 60.0
    );
    Ok(())
}

/// Create a callback that prints pipeline events to the console.
fn create_console_callback() -> PipelineCallback {
    Box::new(move |event| match event {
        PipelineEvent::DocumentStart { id, chars } => {
            println!();
            println!(
                "{} {} {}",
                "▶".bright_cyan(),
                id.bright_cyan().bold(),
                format!("({} chars)", chars).dimmed()
            );
        }
        PipelineEvent::DedupComplete { stats, .. } => {
            println!(
                "  dedup: {} removed, {} condensed, {} kept",
                stats.removed, stats.condensed, stats.kept
            );
        }
        PipelineEvent::ScriptRendered { utterances, .. } => {
            println!("  script: {} utterances", utterances);
        }
        PipelineEvent::ChunksPlanned {
            chunks,
            total_duration,
            ..
        } => {
            println!(
                "  plan: {} chunks, ~{:.1} min",
                chunks,
                total_duration.as_secs_f64() / 60.0
            );
        }
        PipelineEvent::ChunkSynthesized {
            index,
            tokens,
            attempts,
            ..
        } => {
            let retries = if attempts > 1 {
                format!(" after {} attempts", attempts).yellow().to_string()
            } else {
                String::new()
            };
            println!("  {} chunk {} ({} tokens){}", "✓".green(), index, tokens, retries);
        }
        PipelineEvent::ArtifactWritten { path, size, .. } => {
            println!(
                "  {} {} ({} KiB)",
                "saved".bright_green().bold(),
                path.display(),
                size / 1024
            );
        }
        PipelineEvent::DocumentFailed { id, error } => {
            println!("  {} {}: {}", "failed".red().bold(), id, error);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(paths: &[&str]) -> Vec<String> {
        let paths: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
        document_ids(&paths)
    }

    #[test]
    fn test_single_file_id_is_stem() {
        assert_eq!(ids(&["/lessons/ownership.md"]), vec!["ownership"]);
    }

    #[test]
    fn test_same_stem_in_different_directories() {
        assert_eq!(
            ids(&["/lessons/module-1/intro.md", "/lessons/module-2/intro.md"]),
            vec!["module-1/intro", "module-2/intro"]
        );
    }

    #[test]
    fn test_ids_relative_to_common_root() {
        assert_eq!(
            ids(&["/lessons/basics.md", "/lessons/advanced/traits.mdx"]),
            vec!["basics", "advanced/traits"]
        );
    }

    #[test]
    fn test_same_file_twice_collides() {
        let ids = ids(&["/lessons/intro.md", "/lessons/intro.md"]);
        assert_eq!(ids[0], ids[1]);
    }
}
