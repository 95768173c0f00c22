use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use funcpass::{
    AnalysisPass, BlockFlags, FunctionPass, FunctionTable, ImageDebuggee, IndicatifProgressBar,
    NoOpProgressReporter, PassConfig, RegisteredFunction, RuntimeFunction, linear_sweep,
};
use std::path::PathBuf;
use struson::writer::{JsonStreamWriter, JsonWriter};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Plain text output
    Text,
    /// JSON output
    Json,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Analyze(CommandAnalyze),
    Table(CommandTable),
}

/// Recover function boundaries in a PE file
#[derive(Parser)]
struct CommandAnalyze {
    /// Path to the PE file
    #[arg(short, long)]
    file: PathBuf,

    /// First virtual address to analyze (defaults to the start of code)
    #[arg(long, value_parser = parse_hex)]
    start: Option<u64>,

    /// Virtual address one past the last analyzed byte (defaults to the end of code)
    #[arg(long, value_parser = parse_hex)]
    end: Option<u64>,

    /// Number of worker threads
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Don't reserve candidate storage for each worker up front
    #[arg(long)]
    conserve_memory: bool,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,

    /// Output format
    #[arg(short = 'o', long, default_value_t = OutputFormat::Text, value_enum)]
    format: OutputFormat,
}

/// Dump the exception directory of a PE file
#[derive(Parser)]
struct CommandTable {
    /// Path to the PE file
    #[arg(short, long)]
    file: PathBuf,

    /// Output format
    #[arg(short = 'o', long, default_value_t = OutputFormat::Text, value_enum)]
    format: OutputFormat,
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze(cmd) => command_analyze(cmd),
        Commands::Table(cmd) => command_table(cmd),
    }
}

fn command_analyze(cmd: CommandAnalyze) -> Result<()> {
    let image = ImageDebuggee::load(&cmd.file)?;
    let code = image
        .code_range()
        .with_context(|| format!("No executable sections in {}", cmd.file.display()))?;

    let start = cmd.start.unwrap_or(code.start);
    let end = cmd.end.unwrap_or(code.end);
    if start >= end {
        bail!("Empty range 0x{:x}..0x{:x}", start, end);
    }

    let blocks = linear_sweep::build_blocks(&image, start..end)?;
    info!(blocks = blocks.len(), "Built basic blocks");

    let mut config = PassConfig::default().with_pointer_size(image.pointer_size());
    if let Some(threads) = cmd.threads {
        config = config.with_threads(threads);
    }
    if cmd.conserve_memory {
        config = config.conserve_memory();
    }

    let pass = FunctionPass::with_config(start, end, &blocks, &image, config);
    info!(
        entries = pass.function_table().len(),
        threads = pass.config().thread_count(),
        "Running {}",
        pass.name()
    );

    if cmd.progress {
        pass.analyze_with_progress(&IndicatifProgressBar::new(pass.name()));
    } else {
        pass.analyze_with_progress(&NoOpProgressReporter);
    }

    let functions = image.functions();
    let attributed = blocks
        .iter()
        .filter(|block| block.has_flag(BlockFlags::FUNCTION))
        .count();
    info!(
        functions = functions.len(),
        attributed,
        blocks = blocks.len(),
        "Analysis complete"
    );

    match cmd.format {
        OutputFormat::Text => {
            for function in &functions {
                println!("0x{:x} - 0x{:x}", function.start, function.end);
            }
        }
        OutputFormat::Json => write_functions_json(&functions)?,
    }

    Ok(())
}

fn command_table(cmd: CommandTable) -> Result<()> {
    let image = ImageDebuggee::load(&cmd.file)?;
    let table = FunctionTable::load(&image, image.image_base());
    let entries: Vec<RuntimeFunction> = table.entries().collect();

    match cmd.format {
        OutputFormat::Text => {
            println!("{} runtime functions", entries.len());
            for entry in &entries {
                println!(
                    "0x{:x} - 0x{:x} unwind 0x{:x}",
                    entry.range.start, entry.range.end, entry.unwind
                );
            }
        }
        OutputFormat::Json => write_table_json(&entries)?,
    }

    Ok(())
}

fn write_functions_json(functions: &[RegisteredFunction]) -> Result<()> {
    let mut json = JsonStreamWriter::new(std::io::stdout().lock());
    json.begin_array()?;
    for function in functions {
        json.begin_object()?;
        json.name("start")?;
        json.string_value(&format!("0x{:x}", function.start))?;
        json.name("end")?;
        json.string_value(&format!("0x{:x}", function.end))?;
        json.name("user_defined")?;
        json.bool_value(function.user_defined)?;
        json.end_object()?;
    }
    json.end_array()?;
    json.finish_document()?;
    println!();
    Ok(())
}

fn write_table_json(entries: &[RuntimeFunction]) -> Result<()> {
    let mut json = JsonStreamWriter::new(std::io::stdout().lock());
    json.begin_array()?;
    for entry in entries {
        json.begin_object()?;
        json.name("begin")?;
        json.string_value(&format!("0x{:x}", entry.range.start))?;
        json.name("end")?;
        json.string_value(&format!("0x{:x}", entry.range.end))?;
        json.name("unwind")?;
        json.string_value(&format!("0x{:x}", entry.unwind))?;
        json.end_object()?;
    }
    json.end_array()?;
    json.finish_document()?;
    println!();
    Ok(())
}
