use std::process;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use proxlb::cli::Args;
use proxlb::config;
use proxlb::scheduler::{self, Scheduler};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // The config decides the log level, so load it before installing the
    // subscriber; load failures go to stderr directly.
    let settings = match config::load(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("proxlb: {e}");
            process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.service.log_level.as_filter())),
        )
        .init();

    let mut masked = settings.clone();
    masked.mask_credentials();
    debug!("Active configuration: {:?}", masked);

    if args.best_node {
        match scheduler::best_node(&settings).await {
            Ok(Some(node)) => {
                println!("{node}");
                process::exit(0);
            }
            Ok(None) => {
                eprintln!("proxlb: no eligible node found");
                process::exit(1);
            }
            Err(e) => {
                error!("Cannot determine best node: {e}");
                process::exit(e.exit_code());
            }
        }
    }

    let scheduler = Scheduler::new(args.config.clone(), args.dry_run, args.json);
    let code = scheduler.run(settings).await;
    process::exit(code);
}
