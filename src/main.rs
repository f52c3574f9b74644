mod cli;

use anyhow::Context;
use clap::Parser;
use cluster_certgen::catalog::Signer;
use cluster_certgen::{ClusterProperties, EmbeddedTemplates, Provisioner, DEFAULT_CATALOG};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Command, GenerateArgs, Output};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Command::Generate(args) => generate(args),
        Command::Catalog => {
            print_catalog();
            Ok(())
        }
    }
}

fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let props = ClusterProperties::from_file(&args.config)?;
    info!(master = %props.master_hostname, config = %args.config.display(), "loaded cluster properties");

    let provisioner = Provisioner::new(props, EmbeddedTemplates).parallel(args.parallel);
    let out = provisioner.prepare()?;

    let mut master = Output::open(&args.master_out, args.format, args.chown)?;
    provisioner
        .write_master(&out, master.filesystem())
        .with_context(|| format!("master flow into {} failed", args.master_out.display()))?;
    master.finish()?;

    let mut node = Output::open(&args.node_out, args.format, args.chown)?;
    provisioner
        .node(&out, node.filesystem())
        .with_context(|| format!("node flow into {} failed", args.node_out.display()))?;
    node.finish()?;

    info!(
        master = %args.master_out.display(),
        node = %args.node_out.display(),
        "provisioning complete"
    );
    Ok(())
}

fn print_catalog() {
    for descriptor in DEFAULT_CATALOG {
        let signer = match descriptor.signer {
            Signer::SelfSigned => "self",
            Signer::Role(role) => role,
        };
        println!(
            "{:<24} {:<16} {:?} {}",
            descriptor.role,
            signer,
            descriptor.profile,
            descriptor.path.unwrap_or("-")
        );
    }
}
