use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{
    default_storage_dir, AgentModel, ChatConfig, ChatSettings, ExecutionEnvironment,
    ThinkingIntensity, DEFAULT_AGENT_BINARY, DEFAULT_WSL_AGENT_PATH, DEFAULT_WSL_DISTRO,
    DEFAULT_WSL_NODE_PATH,
};
use crate::orchestrator::ChatSession;
use crate::router::build_router;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2470;

#[derive(Parser, Debug)]
#[command(name = "agent-chat", bin_name = "agent-chat", version)]
#[command(about = "Chat front end for a locally installed coding agent")]
#[command(arg_required_else_help = true)]
pub struct AgentChatCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat HTTP server for one workspace.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory the agent works in. Defaults to the current directory.
    #[arg(long, short = 'w')]
    workspace: Option<PathBuf>,

    /// Where conversations, rules, and checkpoints are kept.
    #[arg(long, env = "AGENT_CHAT_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[arg(long, env = "AGENT_CHAT_AGENT_BINARY", default_value = DEFAULT_AGENT_BINARY)]
    agent_binary: String,

    #[arg(long, value_enum, default_value_t = AgentModel::Default)]
    model: AgentModel,

    #[arg(long)]
    skip_permissions: bool,

    #[arg(long, value_enum, default_value_t = ThinkingIntensity::Think)]
    thinking_intensity: ThinkingIntensity,

    /// Run the agent inside WSL.
    #[arg(long)]
    wsl: bool,

    #[arg(long, default_value = DEFAULT_WSL_DISTRO)]
    wsl_distro: String,

    #[arg(long, default_value = DEFAULT_WSL_NODE_PATH)]
    wsl_node_path: String,

    #[arg(long, default_value = DEFAULT_WSL_AGENT_PATH)]
    wsl_agent_path: String,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

impl ServerArgs {
    fn chat_config(&self) -> Result<ChatConfig, CliError> {
        let workspace = match &self.workspace {
            Some(path) => path.clone(),
            None => std::env::current_dir()?,
        };
        if !workspace.is_dir() {
            return Err(CliError::InvalidWorkspace(workspace));
        }
        let storage_dir = self
            .storage_dir
            .clone()
            .unwrap_or_else(|| default_storage_dir(&workspace));

        let environment = if self.wsl {
            ExecutionEnvironment::Wsl {
                distro: self.wsl_distro.clone(),
                node_path: self.wsl_node_path.clone(),
                agent_path: self.wsl_agent_path.clone(),
            }
        } else {
            ExecutionEnvironment::Native
        };

        let mut config = ChatConfig::new(workspace, storage_dir);
        config.agent_binary = self.agent_binary.clone();
        config.model = self.model;
        config.settings = ChatSettings {
            environment,
            skip_permissions: self.skip_permissions,
            thinking_intensity: self.thinking_intensity,
        };
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("workspace is not a directory: {}", .0.display())]
    InvalidWorkspace(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_chat() -> Result<(), CliError> {
    let cli = AgentChatCli::parse();
    init_logging()?;
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = server.chat_config()?;
    let cors = build_cors_layer(server)?;
    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let session = ChatSession::start(config)
            .await
            .map_err(|err| CliError::Server(err.to_string()))?;
        let router = build_router(session.clone()).layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
                session.shutdown().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    Ok(cors.allow_methods(Any).allow_headers(Any))
}
