use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "send",
    version,
    about = "Send files to a receiver on the same network, paired by a code phrase",
    long_about = "`send` exposes a set of local files over a TLS-secured HTTP endpoint and \
broadcasts an authenticated multicast beacon so a `receive` peer on the same network can \
find it, pair with it using a generated code phrase, and download the files.

EXAMPLES:
    # Send a single file, printing the generated code phrase
    send doc.pdf

    # Send a directory on a fixed port with a longer pairing timeout
    send ./photos -p 53317 -t 600"
)]
struct Args {
    /// Files or directories to send
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// TCP port to serve on (default: first free port in 53317-53417)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Seconds to wait for a receiver to connect and finish downloading
    #[arg(short = 't', long = "timeout", default_value = "300", value_name = "SECS")]
    timeout_sec: u64,

    /// Verbose level: -v DEBUG / -vv+ TRACE (default: INFO)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode, only the code phrase and errors are printed
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
    tracing::debug!(?args, "parsed send arguments");

    for path in &args.paths {
        if !path.exists() {
            return Err(anyhow!("path does not exist: {}", path.display()));
        }
    }

    let config = sendcode_core::SendConfig {
        paths: args.paths.clone(),
        port: args.port,
        common: sendcode_core::Config {
            timeout: Duration::from_secs(args.timeout_sec),
            verbose: args.verbose,
            quiet: args.quiet,
        },
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(sendcode_core::send(config));

    match outcome {
        Ok(outcome) => {
            if !args.quiet {
                println!(
                    "sent {} file(s) using code phrase '{}'",
                    outcome.files_sent, outcome.code_phrase
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
