mod cli;
mod commands {
    pub mod backup;
    pub mod files;
    pub mod sync;
    pub mod workspace;
}

use clap::Parser;
use cli::{BackupCmd, Cli, Command, FileCmd, SyncCmd, TokenCmd, WorkspaceCmd};
use ns_core::service::{github_connector, SyncService};
use ns_core::{AppError, AppResult};
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "NS_LOG";

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub(crate) fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub(crate) fn open_service(root: &str) -> AppResult<SyncService> {
    SyncService::open(Path::new(root), github_connector())
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cmd: Command, cancel: &CancellationToken) -> AppResult<()> {
    match cmd {
        Command::Workspace { cmd } => match cmd {
            WorkspaceCmd::Init {
                root,
                ws_name,
                owner,
                repo,
                branch,
                api_base,
            } => commands::workspace::run_init(&root, &ws_name, owner, repo, branch, api_base),
            WorkspaceCmd::Open { root } => commands::workspace::run_open(&root),
        },
        Command::Token { cmd } => match cmd {
            TokenCmd::Set { root, token_env } => {
                commands::workspace::run_set_token(&root, &token_env, cancel).await
            }
        },
        Command::File { cmd } => match cmd {
            FileCmd::Write {
                root,
                ws_path,
                source,
            } => commands::files::run_write(&root, &ws_path, source.as_deref()),
            FileCmd::Read { root, ws_path } => commands::files::run_read(&root, &ws_path, cancel).await,
            FileCmd::Delete { root, ws_path } => {
                commands::files::run_delete(&root, &ws_path, cancel).await
            }
            FileCmd::List { root } => commands::files::run_list(&root),
        },
        Command::Sync { cmd } => match cmd {
            SyncCmd::Run { root, verbose } => commands::sync::run_sync(&root, verbose, cancel).await,
            SyncCmd::Status { root } => commands::sync::run_status(&root),
            SyncCmd::Runs { root, limit } => commands::sync::run_runs(&root, limit),
            SyncCmd::Conflicts { root } => commands::sync::run_conflicts(&root, cancel).await,
            SyncCmd::Resolve { root } => commands::sync::run_resolve(&root, cancel).await,
            SyncCmd::Discard { root } => commands::sync::run_discard(&root, cancel).await,
            SyncCmd::Optimize {
                root,
                prune_unused,
                retain,
            } => commands::sync::run_optimize(&root, prune_unused, &retain, cancel).await,
        },
        Command::Backup { cmd } => match cmd {
            BackupCmd::Create { root, out_dir } => {
                commands::backup::run_create(&root, out_dir.as_deref(), cancel).await
            }
            BackupCmd::Verify { bundle_dir } => commands::backup::run_verify(&bundle_dir),
            BackupCmd::Restore { root, bundle_dir } => {
                commands::backup::run_restore(&root, &bundle_dir, cancel).await
            }
        },
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(async {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });
            run(cli.cmd, &cancel).await
        }),
        Err(e) => Err(AppError::new(
            ns_core::ErrorCode::Internal,
            "failed to start async runtime",
            serde_json::json!({ "error": e.to_string() }),
        )),
    };

    if let Err(err) = result {
        eprintln!("{}: {}", err.code, err.message);
        std::process::exit(1);
    }
}
