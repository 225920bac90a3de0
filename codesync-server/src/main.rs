//! codesync-server: runs the collaboration server.
//!
//! ```text
//! RUST_LOG=info codesync-server --storage-root ./repos --invite my-repo=ada@example.com
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use codesync_collab::{
    invite, AnonymousAuthenticator, DiskStore, FileStore, LogNotifier, MemoryStore,
    NoopRevisionLog, ServerConfig, SyncServer,
};

#[derive(Parser, Debug)]
#[command(name = "codesync-server")]
#[command(about = "Real-time collaborative code editing server")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "CODESYNC_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Directory with one subdirectory per repository (in-memory if unset)
    #[arg(long, env = "CODESYNC_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Collaboration token lifetime in seconds
    #[arg(long, env = "CODESYNC_TOKEN_TTL_SECS", default_value_t = 3600)]
    token_ttl_secs: u64,

    /// Frames buffered per connection before the oldest are dropped
    #[arg(long, env = "CODESYNC_OUTBOX_CAPACITY", default_value_t = 256)]
    outbox_capacity: usize,

    /// Maximum members per room
    #[arg(long, env = "CODESYNC_MAX_MEMBERS", default_value_t = 100)]
    max_members: usize,

    /// Reject operations not based on the current file revision
    #[arg(long, env = "CODESYNC_STRICT_REVISIONS")]
    strict_revisions: bool,

    /// Repository used by solo-mode connections
    #[arg(long, env = "CODESYNC_SOLO_RESOURCE", default_value = "default")]
    solo_resource: String,

    /// Issue a collaboration token at startup: `repository=addr[,addr...]`
    #[arg(long = "invite", value_name = "REPO=RECIPIENTS")]
    invites: Vec<String>,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            max_members_per_room: self.max_members,
            outbox_capacity: self.outbox_capacity.max(1),
            token_ttl: Duration::from_secs(self.token_ttl_secs),
            strict_revisions: self.strict_revisions,
            storage_root: self.storage_root.clone(),
            solo_resource: self.solo_resource.clone(),
            ..ServerConfig::default()
        }
    }
}

/// Split `repo=a@x,b@y` into the repository and its recipients.
fn parse_invite(arg: &str) -> Option<(String, Vec<String>)> {
    let (repo, recipients) = arg.split_once('=')?;
    let recipients: Vec<String> = recipients
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();
    if repo.is_empty() || recipients.is_empty() {
        return None;
    }
    Some((repo.to_string(), recipients))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.server_config();

    let store: Arc<dyn FileStore> = match &config.storage_root {
        Some(root) => {
            log::info!("Serving repositories from {}", root.display());
            Arc::new(DiskStore::new(root.clone()))
        }
        None => {
            log::warn!("No storage root given; repositories live in memory only");
            let memory = MemoryStore::new();
            memory.add_resource(config.solo_resource.as_str());
            for (repo, _) in cli.invites.iter().filter_map(|arg| parse_invite(arg)) {
                memory.add_resource(repo);
            }
            Arc::new(memory)
        }
    };

    let server = SyncServer::with_parts(
        config,
        store,
        Arc::new(NoopRevisionLog),
        Arc::new(AnonymousAuthenticator),
    );

    for arg in &cli.invites {
        let Some((repo, recipients)) = parse_invite(arg) else {
            log::error!("Ignoring malformed --invite '{arg}' (expected REPO=RECIPIENTS)");
            continue;
        };
        if let Err(e) = invite(server.registry(), &LogNotifier, &repo, recipients).await {
            log::error!("Could not invite to {repo}: {e}");
        }
    }

    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Ctrl-C received, shutting down");
                handle.shutdown();
            }
            Err(e) => log::error!("Failed to listen for Ctrl-C: {e}"),
        }
    });

    if let Err(e) = server.run().await {
        log::error!("Server error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invite() {
        assert_eq!(
            parse_invite("repo=ada@example.com, bob@example.com"),
            Some((
                "repo".to_string(),
                vec!["ada@example.com".to_string(), "bob@example.com".to_string()]
            ))
        );
        assert_eq!(parse_invite("repo"), None);
        assert_eq!(parse_invite("=ada@example.com"), None);
        assert_eq!(parse_invite("repo=,"), None);
    }

    #[test]
    fn test_cli_maps_onto_server_config() {
        let cli = Cli::parse_from([
            "codesync-server",
            "--bind",
            "0.0.0.0:8000",
            "--token-ttl-secs",
            "60",
            "--strict-revisions",
            "--invite",
            "repo=ada@example.com",
        ]);
        let config = cli.server_config();
        assert_eq!(config.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.token_ttl, Duration::from_secs(60));
        assert!(config.strict_revisions);
        assert_eq!(config.max_members_per_room, 100);
        assert_eq!(cli.invites.len(), 1);
    }
}
