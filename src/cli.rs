use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use cluster_certgen::{Filesystem, LocalFilesystem, TarGzFilesystem};

/// Generates the PKI, kubeconfigs and static files that bootstrap a cluster
#[derive(Parser, Debug)]
#[command(name = "cluster-certgen", version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate master and node artifacts signed by one fresh set of CAs
    Generate(GenerateArgs),

    /// Print the identities that would be issued, in issuing order
    Catalog,
}

#[derive(Parser, Debug)]
pub struct GenerateArgs {
    /// Cluster properties file (TOML)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Where the master artifacts go
    #[arg(long)]
    pub master_out: PathBuf,

    /// Where the node artifacts go
    #[arg(long)]
    pub node_out: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Tgz)]
    pub format: OutputFormat,

    /// Apply file ownership (dir format only; usually needs root)
    #[arg(long)]
    pub chown: bool,

    /// Issue independent certificates on multiple threads
    #[arg(long)]
    pub parallel: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// A gzip'd tarball carrying ownership and modes
    Tgz,
    /// A directory tree on the local disk
    Dir,
}

/// An opened output target.
pub enum Output {
    Tgz(TarGzFilesystem<BufWriter<File>>),
    Dir(LocalFilesystem),
}

impl Output {
    pub fn open(path: &Path, format: OutputFormat, chown: bool) -> anyhow::Result<Self> {
        match format {
            OutputFormat::Tgz => {
                let file = File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                Ok(Output::Tgz(TarGzFilesystem::new(BufWriter::new(file))))
            }
            OutputFormat::Dir => {
                fs::create_dir_all(path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                Ok(Output::Dir(LocalFilesystem::new(path).with_ownership(chown)))
            }
        }
    }

    pub fn filesystem(&mut self) -> &mut dyn Filesystem {
        match self {
            Output::Tgz(fs) => fs,
            Output::Dir(fs) => fs,
        }
    }

    pub fn finish(self) -> anyhow::Result<()> {
        if let Output::Tgz(fs) = self {
            let mut writer = fs.finish().context("failed to finish archive")?;
            writer.flush().context("failed to flush archive")?;
        }
        Ok(())
    }
}
