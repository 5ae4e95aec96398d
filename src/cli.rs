use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "consensus-reports",
    version,
    about = "Extract consensus benchmark metrics from Prometheus and publish reports"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query every configured window and upload the documents.
    Replicate(ReplicateArgs),
    /// Render the HTML report from a run's window documents, local or on WebDAV.
    Report(ReportArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ReplicateArgs {
    #[arg(long)]
    pub config: PathBuf,
    #[arg(long, default_value_t = false)]
    pub keep_tmp: bool,
    #[arg(long, default_value_t = false)]
    pub skip_upload: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    #[arg(long)]
    pub config: PathBuf,
    /// Directory holding `config.json` and the window documents.
    #[arg(long, required_unless_present = "remote", conflicts_with = "remote")]
    pub input_dir: Option<PathBuf>,
    /// Read the documents from the run's WebDAV directory instead.
    #[arg(long, default_value_t = false)]
    pub remote: bool,
    #[arg(long)]
    pub output: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub upload: bool,
}
