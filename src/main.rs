use clap::{Parser, Subcommand};
use pharkit::analyzer::{summarize, ArchiveSummary};
use pharkit::archive::Archive;
use pharkit::codec::CompressionKind;
use pharkit::ops::{self, ExtractRequest, RepackRequest};
use pharkit::signature::SignatureAlgorithm;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pharkit", about = "Extract and repack PHAR archives")]
struct Cli {
    /// Log every entry as it is processed
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a PHAR file into a directory
    Extract {
        source: PathBuf,
        target: PathBuf,
    },
    /// Create a PHAR file from a previously extracted directory
    Repack {
        source: PathBuf,
        target: PathBuf,
        /// Signature algorithm: md5, sha1 (default), sha256, sha512
        #[arg(long, value_parser = parse_signature)]
        signature: Option<SignatureAlgorithm>,
        /// Force one compression kind instead of the recorded profile: none, gz, bz2
        #[arg(long, value_parser = parse_compression)]
        compression: Option<CompressionKind>,
    },
    /// Show archive contents summary
    Analyze {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { source, target } => {
            let outcome = ops::extract(&ExtractRequest { source: source.clone(), target: target.clone() })?;
            print_summary("Original PHAR", &source, &outcome.summary);
            println!("Extracted to: {}", target.display());
        }

        // ── Repack ───────────────────────────────────────────────────────────
        Commands::Repack { source, target, signature, compression } => {
            let outcome = ops::repack(&RepackRequest {
                source: source.clone(),
                target: target.clone(),
                signature,
                compression,
            })?;
            println!("Repacking complete!");
            println!("  Files processed  {}", outcome.files_processed);
            println!("  Compression      {}{}", outcome.compression,
                     if outcome.used_sidecar { "" } else { " (default, no sidecar)" });
            println!("  Signature        {}", outcome.signature);
            println!("  New size         {} B", outcome.archive_size);
            print_summary("New PHAR", &target, &outcome.summary);
        }

        // ── Analyze ──────────────────────────────────────────────────────────
        Commands::Analyze { input } => {
            let ar = Archive::open(&input)?;
            print_summary("PHAR Archive", &input, &summarize(&ar));
            if !ar.alias().is_empty() {
                println!("  Alias          {}", ar.alias());
            }
            if !ar.metadata().is_null() {
                println!("  Metadata       {}", serde_json::to_string(ar.metadata())?);
            }
            if let Some(sig) = ar.signature() {
                println!("  Digest         {}", hex::encode(&sig.bytes));
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(title: &str, path: &Path, summary: &ArchiveSummary) {
    println!("── {title} ─────────────────────────────────────────");
    println!("  Path           {}", path.display());
    println!("{summary}");
}

fn parse_signature(s: &str) -> Result<SignatureAlgorithm, String> {
    match SignatureAlgorithm::from_name(s) {
        Some(alg) if alg.is_hash() => Ok(alg),
        Some(alg) => Err(format!("{alg} signatures cannot be produced")),
        None      => Err(format!("unknown signature algorithm '{s}'")),
    }
}

fn parse_compression(s: &str) -> Result<CompressionKind, String> {
    CompressionKind::from_name(s).ok_or_else(|| format!("unknown compression '{s}' (none, gz, bz2)"))
}
