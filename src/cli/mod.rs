//! Command-line surface
//!
//! - `proxlb` — run per the configuration (one-shot or daemon)
//! - `proxlb -d` — plan only, print the would-be moves
//! - `proxlb -j` — print the plan as JSON on stdout
//! - `proxlb -b` — print the best node for a new guest and exit

use std::path::PathBuf;

use clap::{ArgAction, Parser};

mod display;

pub use display::{format_plan, format_results, node_metrics_lines};

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(name = "proxlb")]
#[command(about = "Workload rebalancer for Proxmox VE clusters")]
#[command(version, disable_version_flag = true)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Compute and print the plan without executing any migration
    #[arg(short = 'd', long = "dry-run")]
    pub dry_run: bool,

    /// Print the plan as JSON on stdout instead of text
    #[arg(short = 'j', long = "json")]
    pub json: bool,

    /// Print the best destination node for a new guest and exit
    #[arg(short = 'b', long = "best-node")]
    pub best_node: bool,

    /// Print version information and exit
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    pub version: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["proxlb"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!args.dry_run);
        assert!(!args.json);
        assert!(!args.best_node);
    }

    #[test]
    fn test_all_flags() {
        let args = Args::parse_from(["proxlb", "-c", "/tmp/test.yaml", "-d", "-j", "-b"]);
        assert_eq!(args.config, PathBuf::from("/tmp/test.yaml"));
        assert!(args.dry_run);
        assert!(args.json);
        assert!(args.best_node);
    }

    #[test]
    fn test_long_flags() {
        let args = Args::parse_from(["proxlb", "--config", "x.yaml", "--dry-run", "--json"]);
        assert!(args.dry_run);
        assert!(args.json);
    }
}
