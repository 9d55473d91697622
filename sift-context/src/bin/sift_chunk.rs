use clap::Parser;
use sift_context::{Chunker, ChunkingConfig, ExtractedContent, SchemaAnalyzer, extract};
use std::fs;
use std::path::PathBuf;

/// Prints the content units of one file as JSON, for tuning chunk and schema heuristics.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input file. The extension selects prose or tabular handling.
    input: PathBuf,

    /// Maximum words per prose chunk.
    #[arg(short, long, default_value_t = 800)]
    target_words: usize,

    /// Words carried over between adjacent prose chunks.
    #[arg(short, long, default_value_t = 100)]
    overlap_words: usize,

    /// Sentences shorter than this are treated as noise.
    #[arg(short, long, default_value_t = 2)]
    min_sentence_words: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = ChunkingConfig::default()
        .with_target_words(args.target_words)
        .with_overlap_words(args.overlap_words)
        .with_min_sentence_words(args.min_sentence_words);
    config.validate()?;

    let bytes = fs::read(&args.input)?;
    let extension = args
        .input
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    let source = args.input.to_string_lossy();

    let units = match extract(&bytes, extension)? {
        ExtractedContent::Prose(doc) => Chunker::new(config).chunk(&doc.text, &source),
        ExtractedContent::Tabular(doc) => SchemaAnalyzer::default().decompose(&doc, &source),
    };

    println!("{}", serde_json::to_string_pretty(&units)?);
    Ok(())
}
