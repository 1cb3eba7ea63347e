//! `tether`: developer tooling for Tether plugins.
//!
//! Usage:
//!   tether order plugins/
//!   tether check plugins/ --plugin acme.notes
//!   tether keygen --out signing.key
//!   tether pack --manifest manifest.toml --module plugin.wasm --key signing.key --out notes.tpk
//!   tether inspect notes.tpk --trusted-key <hex>
//!   tether config tether.toml

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tether_cli::{PackRequest, SignatureStatus};
use tether_deps::CheckOptions;
use tether_package::VerifyingKey;
use tether_types::PluginId;

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Tether plugin tooling")]
struct Args {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the installation order of a directory of manifests
    Order {
        dir: PathBuf,
    },
    /// Check dependencies of a directory of manifests
    Check {
        dir: PathBuf,
        /// Only check this plugin
        #[arg(short, long)]
        plugin: Option<String>,
        /// Skip OPTIONAL edges
        #[arg(long)]
        ignore_optional: bool,
        /// Do not report CONFLICTS edges
        #[arg(long)]
        no_conflicts: bool,
    },
    /// Generate an Ed25519 signing key
    Keygen {
        #[arg(short, long, default_value = "signing.key")]
        out: PathBuf,
        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Build a plugin package
    Pack {
        #[arg(short, long, default_value = "manifest.toml")]
        manifest: PathBuf,
        #[arg(long)]
        module: PathBuf,
        #[arg(long)]
        readme: Option<PathBuf>,
        /// Signing key file written by `keygen`
        #[arg(short, long)]
        key: Option<PathBuf>,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Show a package's manifest, hash and signature status
    Inspect {
        package: PathBuf,
        /// Hex public key to verify against (repeatable)
        #[arg(long = "trusted-key")]
        trusted_keys: Vec<String>,
    },
    /// Validate a kernel config file
    Config {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tether_runtime::logging::init(args.verbose);

    match run(args.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns false when the command ran but found problems.
async fn run(command: Command) -> Result<bool> {
    match command {
        Command::Order { dir } => {
            let manifests = tether_cli::load_manifests(&dir)?;
            for (i, id) in tether_cli::installation_order(&manifests)?.iter().enumerate() {
                println!("{:>3}. {id}", i + 1);
            }
            Ok(true)
        }
        Command::Check {
            dir,
            plugin,
            ignore_optional,
            no_conflicts,
        } => {
            let manifests = tether_cli::load_manifests(&dir)?;
            let options = CheckOptions {
                ignore_optional,
                check_conflicts: !no_conflicts,
                ..CheckOptions::default()
            };
            let only = plugin.map(PluginId::new);
            let reports = tether_cli::check_all(&manifests, only.as_ref(), &options).await?;
            for report in &reports {
                println!("{}", tether_cli::render_report(report));
            }
            Ok(reports.iter().all(|r| r.success))
        }
        Command::Keygen { out, force } => {
            let public = tether_cli::keygen(&out, force)?;
            println!("Signing key written to {}", out.display());
            println!("Public key: {}", public.to_hex());
            Ok(true)
        }
        Command::Pack {
            manifest,
            module,
            readme,
            key,
            out,
        } => {
            let hash = tether_cli::pack(&PackRequest {
                manifest,
                module,
                readme,
                key,
                out: out.clone(),
            })?;
            println!("{} ({hash})", out.display());
            Ok(true)
        }
        Command::Inspect {
            package,
            trusted_keys,
        } => {
            let trusted = trusted_keys
                .iter()
                .map(|k| VerifyingKey::from_hex(k))
                .collect::<tether_package::Result<Vec<_>>>()?;
            let summary = tether_cli::inspect(&package, &trusted)?;
            let plugin = &summary.manifest.plugin;
            println!("Plugin:    {} {} ({})", plugin.id, plugin.version, plugin.name);
            println!(
                "Module:    {} bytes, format {}, entry {}",
                summary.module_bytes, summary.manifest.module.format, summary.manifest.module.entry
            );
            println!("README:    {}", if summary.has_readme { "yes" } else { "no" });
            println!("Hash:      {}", summary.content_hash);
            match summary.signature {
                SignatureStatus::Unsigned => println!("Signature: none"),
                SignatureStatus::Unverified => println!("Signature: present, not verified"),
                SignatureStatus::Trusted(key) => println!("Signature: trusted ({key})"),
            }
            Ok(true)
        }
        Command::Config { path } => {
            let config = tether_cli::check_config(&path)?;
            println!(
                "{} is valid: policy {:?}, {} trusted key(s), max {} sandboxes",
                path.display(),
                config.policy.mode,
                config.packages.trusted_keys.len(),
                config.sandbox.max_sandboxes
            );
            Ok(true)
        }
    }
}
