use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use coedit_auth::{Principal, Role, TokenIssuer, TokenVerifier};
use coedit_server::{gateway, AppState, RoomRegistry, ServerConfig};
use coedit_store::{valid_doc_id, Acl, DocumentMeta, DocumentStore, FsStore, Permission};

#[derive(Parser)]
#[command(name = "coedit", version, about = "Real-time collaborative document server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket gateway.
    Serve(ServeArgs),
    /// Mint a development bearer token.
    MintToken(MintTokenArgs),
    /// Seed a document record in the data directory.
    CreateDocument(CreateDocumentArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Directory holding durable document state.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// HS256 secret used to verify bearer tokens.
    #[arg(long, env = "COEDIT_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Room persistence cadence in seconds.
    #[arg(long, default_value_t = 2)]
    persist_interval: u64,

    /// Merged updates between forced snapshots.
    #[arg(long, default_value_t = 100)]
    snapshot_update_threshold: u64,

    /// Seconds a dirty room may go without a snapshot.
    #[arg(long, default_value_t = 300)]
    snapshot_time_threshold: u64,

    /// Snapshots retained per document.
    #[arg(long, default_value_t = 16)]
    snapshot_keep: usize,

    /// Seconds an empty, clean room survives before destruction.
    #[arg(long, default_value_t = 60)]
    room_idle_ttl: u64,

    /// Outbound queue bound per session, in frames.
    #[arg(long, default_value_t = 1024)]
    session_outbound_capacity: usize,

    /// Server ping cadence in seconds.
    #[arg(long, default_value_t = 15)]
    heartbeat_interval: u64,

    /// Consecutive missed pongs tolerated before closing.
    #[arg(long, default_value_t = 2)]
    heartbeat_miss_limit: u32,

    /// Seconds allowed from connect to authentication.
    #[arg(long, default_value_t = 10)]
    auth_deadline: u64,

    /// Seconds allowed for a join, including the state load.
    #[arg(long, default_value_t = 15)]
    join_deadline: u64,

    /// Per-frame socket write budget in seconds.
    #[arg(long, default_value_t = 10)]
    write_timeout: u64,

    /// Graceful shutdown budget in seconds.
    #[arg(long, default_value_t = 30)]
    shutdown_grace: u64,
}

#[derive(Args)]
struct MintTokenArgs {
    #[arg(long, env = "COEDIT_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Stable principal id to embed in the token.
    #[arg(long)]
    principal_id: String,

    #[arg(long)]
    display_name: String,

    /// One of: admin, editor, viewer, user.
    #[arg(long, default_value = "editor")]
    role: String,

    /// Permission strings to embed, repeatable.
    #[arg(long = "permission")]
    permissions: Vec<String>,

    /// Token lifetime in seconds.
    #[arg(long, default_value_t = 3600)]
    ttl: i64,
}

#[derive(Args)]
struct CreateDocumentArgs {
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    #[arg(long)]
    id: String,

    #[arg(long)]
    title: String,

    /// Owner principal id; owners always have write access.
    #[arg(long)]
    owner: String,

    /// Grant implicit read access to every authenticated principal.
    #[arg(long)]
    public: bool,

    /// Collaborator grants as `principal=read` or `principal=write`,
    /// repeatable.
    #[arg(long = "collaborator")]
    collaborators: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::MintToken(args) => mint_token(args),
        Command::CreateDocument(args) => create_document(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = Arc::new(ServerConfig {
        persist_interval: Duration::from_secs(args.persist_interval),
        snapshot_update_threshold: args.snapshot_update_threshold,
        snapshot_time_threshold: Duration::from_secs(args.snapshot_time_threshold),
        room_idle_ttl: Duration::from_secs(args.room_idle_ttl),
        session_outbound_capacity: args.session_outbound_capacity,
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        heartbeat_miss_limit: args.heartbeat_miss_limit,
        auth_deadline: Duration::from_secs(args.auth_deadline),
        join_deadline: Duration::from_secs(args.join_deadline),
        write_timeout: Duration::from_secs(args.write_timeout),
        shutdown_grace: Duration::from_secs(args.shutdown_grace),
        ..ServerConfig::default()
    });

    let store = Arc::new(FsStore::with_policy(
        &args.data_dir,
        args.snapshot_keep,
        config.snapshot_time_threshold,
    ));
    let registry = RoomRegistry::new(store, config.clone());
    let verifier = TokenVerifier::new(&args.jwt_secret);
    let state = AppState::new(verifier, registry, config);

    gateway::serve(args.bind, state).await
}

fn mint_token(args: MintTokenArgs) -> anyhow::Result<()> {
    let role: Role = args
        .role
        .parse()
        .ok()
        .context("role must be one of: admin, editor, viewer, user")?;
    let principal = Principal {
        principal_id: args.principal_id,
        display_name: args.display_name,
        role,
        permissions: args.permissions,
    };
    let token = TokenIssuer::new(&args.jwt_secret)
        .issue(&principal, args.ttl)
        .context("token issue failed")?;
    println!("{token}");
    Ok(())
}

async fn create_document(args: CreateDocumentArgs) -> anyhow::Result<()> {
    if !valid_doc_id(&args.id) {
        bail!("document id must be non-empty and use only [A-Za-z0-9_-]");
    }
    let mut acl = Acl::new();
    for grant in &args.collaborators {
        let Some((principal, permission)) = grant.split_once('=') else {
            bail!("collaborator grant {grant:?} is not of the form principal=read|write");
        };
        let permission = match permission {
            "read" => Permission::Read,
            "write" => Permission::Write,
            other => bail!("unknown permission {other:?}, expected read or write"),
        };
        acl.insert(principal.to_owned(), permission);
    }

    let mut meta = DocumentMeta::new(args.id.clone(), args.title, args.owner);
    meta.public = args.public;

    let store = FsStore::new(&args.data_dir);
    store
        .create(&meta, &acl)
        .await
        .with_context(|| format!("creating document {}", args.id))?;
    println!("created document {}", args.id);
    Ok(())
}
