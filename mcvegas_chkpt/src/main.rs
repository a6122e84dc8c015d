//! `chkpt`: inspect checkpoint files written by `mcvegas`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueHint};
use mcvegas::checkpoint::Checkpoint;
use mcvegas::result::Cumulative;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect checkpoint files written by mcvegas")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the number of iterations stored in the checkpoint
    Iter {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    /// Print the result of every stored iteration and the cumulative result after it
    Print {
        /// Number of digits after the decimal point
        #[arg(short, long, default_value_t = 6)]
        precision: usize,
        /// Use scientific notation
        #[arg(short, long)]
        scientific: bool,
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
}

struct Format {
    precision: usize,
    scientific: bool,
}

impl Format {
    fn number(&self, value: f64) -> String {
        if self.scientific {
            format!("{:.*e}", self.precision, value)
        } else {
            format!("{:.*}", self.precision, value)
        }
    }
}

fn read(file: &Path) -> Result<Checkpoint> {
    let checkpoint = Checkpoint::read_file(file)
        .with_context(|| format!("could not read checkpoint `{}`", file.display()))?;
    debug!(
        kind = ?checkpoint.state().kind(),
        version = checkpoint.version(),
        iterations = checkpoint.iterations(),
        "read checkpoint"
    );
    Ok(checkpoint)
}

fn print(checkpoint: &Checkpoint, format: &Format) -> String {
    let mut out = String::new();
    let mut cumulative = Cumulative::new();
    let kind = checkpoint.state().kind();

    for (index, result) in checkpoint.results().iter().enumerate() {
        cumulative.push(result);
        let estimate = cumulative.estimate();
        let relative = if result.mean() == 0.0 {
            0.0
        } else {
            100.0 * result.error() / result.mean().abs()
        };

        let _ = writeln!(
            out,
            "iteration {} [{kind:?}]: N={} E={} +- {} ({}%) eff={}%",
            index + 1,
            result.calls,
            format.number(result.mean()),
            format.number(result.error()),
            format.number(relative),
            format.number(result.efficiency()),
        );
        let _ = writeln!(
            out,
            "  cumulative: N={} E={} +- {} ({}%) chi2/dof={}",
            estimate.calls,
            format.number(estimate.value),
            format.number(estimate.error),
            format.number(estimate.relative_error_percent()),
            format.number(estimate.chi2_dof),
        );
        if let Some(channels) = checkpoint.channel_summary(index) {
            let minimal = channels.minimal_channels();
            if let (Some(&first), Some(max)) = (minimal.first(), channels.maximal_channel()) {
                let _ = writeln!(
                    out,
                    "  channels: D={} wmin={} (N={}) in #{} wmax={} (N={}) in #{max}",
                    format.number(channels.max_difference()),
                    format.number(channels.weights[first]),
                    channels.calls[first],
                    ranges(&minimal),
                    format.number(channels.weights[max]),
                    channels.calls[max],
                );
            }
        }
    }
    out
}

/// Writes ascending channel indices with runs collapsed, e.g. `0-2,5`.
fn ranges(indices: &[usize]) -> String {
    let mut out = String::new();
    let mut rest = indices.iter().copied().peekable();
    while let Some(start) = rest.next() {
        let mut end = start;
        while rest.peek() == Some(&(end + 1)) {
            end += 1;
            rest.next();
        }
        if !out.is_empty() {
            out.push(',');
        }
        if end == start {
            let _ = write!(out, "{start}");
        } else {
            let _ = write!(out, "{start}-{end}");
        }
    }
    out
}

fn run(cli: &Cli) -> Result<String> {
    match &cli.command {
        Command::Iter { file } => Ok(format!("{}\n", read(file)?.iterations())),
        Command::Print {
            precision,
            scientific,
            file,
        } => {
            let format = Format {
                precision: *precision,
                scientific: *scientific,
            };
            Ok(print(&read(file)?, &format))
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    print!("{}", run(&cli)?);
    Ok(())
}
