use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use mersenne_ibdwt::engine::Cpu;
use mersenne_ibdwt::{pm1, prp, Args, CarryKind, Error, Ibdwt, StopToken};

// ======================================================================
// CLI

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CarryOpt {
    Auto,
    Short,
    Long,
}

/// PRP-tests a Mersenne number, or attempts to factor it via P-1.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Prime exponent of the Mersenne number under test.
    exponent: u32,

    /// FFT size, or a signed delta from the default when below 10.
    #[arg(long = "fft", default_value_t = 0, allow_hyphen_values = true)]
    fft: i32,

    /// PRP block size; must divide 10000.
    #[arg(long = "block", default_value_t = 1000)]
    block: u32,

    /// P-1 stage-1 bound; enables P-1.
    #[arg(long = "B1", default_value_t = 0)]
    b1: u32,

    /// P-1 stage-2 bound; defaults to 100 * B1.
    #[arg(long = "B2", default_value_t = 0)]
    b2: u32,

    /// Carry-pipeline selection.
    #[arg(long, value_enum, default_value_t = CarryOpt::Auto)]
    carry: CarryOpt,

    /// Allocation budget in MiB for P-1 stage 2.
    #[arg(long = "maxAlloc", default_value_t = 0)]
    max_alloc: u32,

    /// Stop after this many iterations (benchmark runs).
    #[arg(long, default_value_t = 0)]
    iters: u32,

    /// Iterations between progress lines.
    #[arg(long = "log", default_value_t = 200_000)]
    log: u32,

    /// Checkpoint directory.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Per-kernel profiling.
    #[arg(long = "time-kernels")]
    time_kernels: bool,
}

// ======================================================================
// MAIN

fn run(cli: &Cli) -> Result<(), Error> {
    let args = Args {
        fft_size: cli.fft,
        block_size: cli.block,
        log_step: cli.log,
        carry: match cli.carry {
            CarryOpt::Auto => CarryKind::Auto,
            CarryOpt::Short => CarryKind::Short,
            CarryOpt::Long => CarryKind::Long,
        },
        iters: cli.iters,
        max_alloc_mb: cli.max_alloc,
        time_kernels: cli.time_kernels,
        dir: cli.dir.clone(),
    };

    let stop = StopToken::new();
    let mut gpu = Ibdwt::<Cpu>::make(cli.exponent, &args)?;

    if cli.b1 > 0 {
        let b2 = if cli.b2 > 0 {
            cli.b2
        } else {
            cli.b1.saturating_mul(100)
        };
        match pm1::factor_pm1(&mut gpu, &args, cli.b1, b2, &stop)? {
            Some(factor) => println!("{} P-1 factor: {}", cli.exponent, factor),
            None => println!("{} P-1 no factor (B1={}, B2={})", cli.exponent, cli.b1, b2),
        }
    } else {
        let result = prp::is_prime_prp(&mut gpu, &args, &stop)?;
        println!(
            "{} {} {:016x}",
            cli.exponent,
            if result.is_prime { "PP" } else { "CC" },
            result.res64
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
