use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "receive",
    version,
    about = "Receive files from a sender on the same network, paired by a code phrase",
    long_about = "`receive` listens for an authenticated multicast beacon matching a shared \
code phrase, pins the sender's certificate by fingerprint, and streams the advertised files \
into an output directory.

EXAMPLES:
    # Receive interactively, confirming the manifest and any name conflicts
    receive swift-ocean

    # Receive into a specific directory without prompting
    receive swift-ocean -o ~/Downloads -y"
)]
struct Args {
    /// The code phrase shown by the sender (e.g. swift-ocean)
    code_phrase: String,

    /// Directory to write received files into
    #[arg(short = 'o', long = "output", default_value = ".", value_name = "DIR")]
    output_dir: PathBuf,

    /// Accept the manifest without an interactive confirmation prompt
    #[arg(short = 'y', long = "yes")]
    auto_accept: bool,

    /// Seconds to wait for a matching sender beacon
    #[arg(short = 't', long = "timeout", default_value = "300", value_name = "SECS")]
    timeout_sec: u64,

    /// Verbose level: -v DEBUG / -vv+ TRACE (default: INFO)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode, only the final destination and errors are printed
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);
    tracing::debug!(?args, "parsed receive arguments");

    if !sendcode_core::codephrase::validate(&args.code_phrase) {
        eprintln!(
            "error: '{}' is not a valid code phrase (expected <adjective>-<noun>)",
            args.code_phrase
        );
        std::process::exit(1);
    }

    let config = sendcode_core::ReceiveConfig {
        code_phrase: args.code_phrase,
        output_dir: args.output_dir,
        auto_accept: args.auto_accept,
        common: sendcode_core::Config {
            timeout: Duration::from_secs(args.timeout_sec),
            verbose: args.verbose,
            quiet: args.quiet,
        },
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(sendcode_core::receive(config));

    match outcome {
        Ok(summary) => {
            if !args.quiet {
                println!(
                    "received {} file(s), {} bytes, into {}",
                    summary.files_written,
                    summary.bytes_written,
                    summary.destination.display()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!(
                "tips: make sure both hosts are on the same network, the code phrase matches \
                exactly, and no firewall is blocking UDP 53317 or the sender's TCP port"
            );
            std::process::exit(1);
        }
    }
}
