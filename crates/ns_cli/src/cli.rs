use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ns_cli")]
#[command(about = "NoteSync CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    Workspace {
        #[command(subcommand)]
        cmd: WorkspaceCmd,
    },
    Token {
        #[command(subcommand)]
        cmd: TokenCmd,
    },
    File {
        #[command(subcommand)]
        cmd: FileCmd,
    },
    Sync {
        #[command(subcommand)]
        cmd: SyncCmd,
    },
    Backup {
        #[command(subcommand)]
        cmd: BackupCmd,
    },
}

#[derive(Subcommand)]
pub enum WorkspaceCmd {
    Init {
        root: String,
        ws_name: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long = "api-base")]
        api_base: Option<String>,
    },
    Open { root: String },
}

#[derive(Subcommand)]
pub enum TokenCmd {
    /// Stores the token held in the named environment variable.
    Set {
        root: String,
        #[arg(long = "token-env", default_value = "NS_GITHUB_TOKEN")]
        token_env: String,
    },
}

#[derive(Subcommand)]
pub enum FileCmd {
    /// Writes the contents of `source` (stdin when omitted) to `ws_path`.
    Write {
        root: String,
        ws_path: String,
        source: Option<String>,
    },
    Read { root: String, ws_path: String },
    Delete { root: String, ws_path: String },
    List { root: String },
}

#[derive(Subcommand)]
pub enum SyncCmd {
    Run {
        root: String,
        #[arg(long)]
        verbose: bool,
    },
    Status { root: String },
    Runs {
        root: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Conflicts { root: String },
    Resolve { root: String },
    Discard { root: String },
    Optimize {
        root: String,
        #[arg(long = "prune-unused")]
        prune_unused: bool,
        #[arg(long = "retain")]
        retain: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum BackupCmd {
    Create {
        root: String,
        #[arg(long = "out-dir")]
        out_dir: Option<String>,
    },
    Verify { bundle_dir: String },
    Restore { root: String, bundle_dir: String },
}
