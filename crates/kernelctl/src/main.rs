use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use kernel_client::kernel_manager;
use kernel_client::kernelspec::get_specs;
use kernel_client::session::{self, start_session};
use kernel_client::settings::default_config_path;
use kernel_client::{
    ExecuteRequest, FutureEvent, KernelConnection, KernelConnectionOptions, KernelModel,
    KernelRequest, ServerConnection, ServerSettings, SessionCreate, SettingsOptions,
};
use kernel_wire::MessageType;
use log::{debug, info};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// How long `info` waits for the kernel to answer.
const INFO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Jupyter server base URL (overrides JUPYTER_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// WebSocket base URL, derived from the base URL when omitted
    #[arg(long, global = true)]
    ws_url: Option<String>,
    /// Server token (overrides JUPYTER_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,
    /// JSON config file [default: <config dir>/kernel-client/config.json]
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log filter passed to env_logger
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved server settings
    Config,
    /// List the server's kernelspecs
    Specs,
    /// List running kernels
    Kernels,
    /// List running sessions
    Sessions,
    /// Start a kernel, or a notebook session when --path is given
    Start {
        /// Kernelspec name (server default when omitted)
        #[arg(long)]
        name: Option<String>,
        /// Notebook path for a new session
        #[arg(long)]
        path: Option<String>,
    },
    /// Execute code in a running kernel
    Exec {
        /// The ID of the kernel to execute code in
        id: String,
        /// The code to execute (reads from stdin if not provided)
        code: Option<String>,
    },
    /// Print a kernel's kernel_info reply
    Info { id: String },
    /// Interrupt a kernel given an ID
    Interrupt { id: String },
    /// Restart a kernel given an ID
    Restart { id: String },
    /// Shut down a kernel given an ID
    Shutdown { id: String },
    /// Shut down a session (and its kernel) given an ID
    StopSession { id: String },
}

#[derive(Tabled)]
struct SpecTableRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "DISPLAY NAME")]
    display_name: String,
    #[tabled(rename = "LANGUAGE")]
    language: String,
    #[tabled(rename = "DEFAULT")]
    default: String,
}

#[derive(Tabled)]
struct KernelTableRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "CONNECTIONS")]
    connections: String,
    #[tabled(rename = "LAST ACTIVITY")]
    last_activity: String,
}

impl From<&KernelModel> for KernelTableRow {
    fn from(model: &KernelModel) -> Self {
        KernelTableRow {
            id: model.id.clone(),
            name: model.name.clone(),
            state: model
                .execution_state
                .clone()
                .unwrap_or_else(|| "-".to_string()),
            connections: model
                .connections
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            last_activity: model
                .last_activity
                .map(|at| format_age(Utc::now().signed_duration_since(at)))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
struct SessionTableRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "PATH")]
    path: String,
    #[tabled(rename = "TYPE")]
    kind: String,
    #[tabled(rename = "KERNEL")]
    kernel: String,
    #[tabled(rename = "STATE")]
    state: String,
}

impl From<&session::SessionModel> for SessionTableRow {
    fn from(model: &session::SessionModel) -> Self {
        SessionTableRow {
            id: model.id.clone(),
            path: model.path.clone(),
            kind: model.kind.clone(),
            kernel: model
                .kernel
                .as_ref()
                .map(|k| format!("{} ({})", k.name, k.id))
                .unwrap_or_else(|| "-".to_string()),
            state: model
                .kernel
                .as_ref()
                .and_then(|k| k.execution_state.clone())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Render a duration as "5s ago", "3m ago", "2h ago" or "4d ago".
fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s ago", s),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86_400),
    }
}

/// Keep the first four characters of a token.
fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    if visible.len() == token.len() {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Config file, then environment, then flags.
fn settings_options(cli: &Cli) -> Result<SettingsOptions> {
    let path = cli.config.clone().or_else(default_config_path);
    let from_file = match &path {
        Some(path) => SettingsOptions::load(path)
            .map_err(|e| anyhow!("Failed to read config {}: {}", path.display(), e))?,
        None => SettingsOptions::default(),
    };
    let from_flags = SettingsOptions {
        base_url: cli.base_url.clone(),
        ws_url: cli.ws_url.clone(),
        token: cli.token.clone(),
        ..Default::default()
    };
    Ok(from_file.merge(SettingsOptions::from_env()).merge(from_flags))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let settings = ServerSettings::resolve(settings_options(&cli)?)?;
    debug!("[kernelctl] Using server {}", settings.base_url);
    let server = Arc::new(ServerConnection::new(settings)?);

    match &cli.command {
        Commands::Config => show_config(&server, cli.json),
        Commands::Specs => list_specs(&server, cli.json).await,
        Commands::Kernels => list_kernels(&server, cli.json).await,
        Commands::Sessions => list_sessions(&server, cli.json).await,
        Commands::Start { name, path } => {
            start(&server, name.as_deref(), path.as_deref(), cli.json).await
        }
        Commands::Exec { id, code } => execute_code(server, id, code.as_deref()).await,
        Commands::Info { id } => kernel_info(server, id).await,
        Commands::Interrupt { id } => {
            kernel_manager::interrupt_kernel(&server, id).await?;
            println!("Interrupted kernel {}", id);
            Ok(())
        }
        Commands::Restart { id } => {
            let model = kernel_manager::restart_kernel(&server, id).await?;
            println!(
                "Restarted kernel {} ({})",
                model.id,
                model.execution_state.as_deref().unwrap_or("unknown")
            );
            Ok(())
        }
        Commands::Shutdown { id } => {
            kernel_manager::shutdown_kernel(&server, id).await?;
            println!("Shut down kernel {}", id);
            Ok(())
        }
        Commands::StopSession { id } => {
            session::shutdown_session(&server, id).await?;
            println!("Shut down session {}", id);
            Ok(())
        }
    }
}

fn show_config(server: &ServerConnection, json_output: bool) -> Result<()> {
    let mut settings = (*server.settings()).clone();
    settings.token = settings.token.as_deref().map(mask_token);
    settings.xsrf_token = settings.xsrf_token.as_deref().map(mask_token);

    if json_output {
        return print_json(&settings);
    }
    println!("base url:      {}", settings.base_url);
    println!("ws url:        {}", settings.ws_url);
    println!(
        "token:         {}",
        settings.token.as_deref().unwrap_or("(none)")
    );
    println!("append token:  {}", settings.append_token);
    Ok(())
}

async fn list_specs(server: &ServerConnection, json_output: bool) -> Result<()> {
    let specs = get_specs(server).await?;
    if json_output {
        return print_json(&specs);
    }

    let rows: Vec<SpecTableRow> = specs
        .kernelspecs
        .values()
        .map(|spec| SpecTableRow {
            name: spec.name.clone(),
            display_name: spec.display_name.clone(),
            language: spec.language.clone(),
            default: if spec.name == specs.default { "*" } else { "" }.to_string(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

async fn list_kernels(server: &ServerConnection, json_output: bool) -> Result<()> {
    let kernels = kernel_manager::list_running(server).await?;
    if json_output {
        return print_json(&kernels);
    }
    if kernels.is_empty() {
        println!("No running kernels");
        return Ok(());
    }

    let rows: Vec<KernelTableRow> = kernels.iter().map(KernelTableRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

async fn list_sessions(server: &ServerConnection, json_output: bool) -> Result<()> {
    let sessions = session::list_running(server).await?;
    if json_output {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!("No running sessions");
        return Ok(());
    }

    let rows: Vec<SessionTableRow> = sessions.iter().map(SessionTableRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

async fn start(
    server: &ServerConnection,
    name: Option<&str>,
    path: Option<&str>,
    json_output: bool,
) -> Result<()> {
    let Some(path) = path else {
        let model = kernel_manager::start_new(server, name).await?;
        info!("[kernelctl] Started kernel {}", model.id);
        if json_output {
            return print_json(&model);
        }
        println!("Started kernel {} ({})", model.id, model.name);
        return Ok(());
    };

    let create = SessionCreate {
        path: path.to_string(),
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        kind: "notebook".to_string(),
        kernel: Some(KernelRequest {
            name: name.map(str::to_string),
            id: None,
        }),
    };
    let model = start_session(server, &create).await?;
    info!("[kernelctl] Started session {}", model.id);
    if json_output {
        return print_json(&model);
    }
    println!(
        "Started session {} for {} (kernel {})",
        model.id,
        model.path,
        model.kernel_id().unwrap_or("-")
    );
    Ok(())
}

/// Look up a running kernel and open a WebSocket connection to it.
async fn connect(server: Arc<ServerConnection>, id: &str) -> Result<KernelConnection> {
    let model = kernel_manager::get_kernel_model(&server, id)
        .await?
        .ok_or_else(|| anyhow!("No running kernel with id {}", id))?;
    Ok(KernelConnection::connect(
        &model,
        server,
        KernelConnectionOptions::default(),
    ))
}

async fn kernel_info(server: Arc<ServerConnection>, id: &str) -> Result<()> {
    let kernel = connect(server, id).await?;
    let reply = tokio::time::timeout(INFO_TIMEOUT, kernel.request_kernel_info())
        .await
        .map_err(|_| anyhow!("Kernel {} did not answer kernel_info_request", id))??;
    kernel.dispose();
    print_json(&reply.content)
}

async fn execute_code(server: Arc<ServerConnection>, id: &str, code: Option<&str>) -> Result<()> {
    let code = match code {
        Some(c) => c.to_string(),
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let kernel = connect(server, id).await?;
    let mut request = ExecuteRequest::new(code);
    request.allow_stdin = false;
    let mut future = kernel.request_execute(request, true, None)?;

    while let Some(event) = future.next_event().await {
        let FutureEvent::IOPub(msg) = event else {
            continue;
        };
        match msg.msg_type() {
            MessageType::Stream => {
                let text = msg.content_str("text").unwrap_or_default();
                if msg.content_str("name") == Some("stderr") {
                    eprint!("{}", text);
                    let _ = io::stderr().flush();
                } else {
                    print!("{}", text);
                    let _ = io::stdout().flush();
                }
            }
            MessageType::ExecuteResult | MessageType::DisplayData => {
                if let Some(text) = msg.content["data"]["text/plain"].as_str() {
                    println!("{}", text);
                }
            }
            MessageType::Error => {
                eprintln!(
                    "{}: {}",
                    msg.content_str("ename").unwrap_or_default(),
                    msg.content_str("evalue").unwrap_or_default()
                );
                if let Some(traceback) = msg.content["traceback"].as_array() {
                    for line in traceback.iter().filter_map(|l| l.as_str()) {
                        eprintln!("{}", line);
                    }
                }
            }
            _ => {}
        }
    }

    let reply = future.done().await?;
    kernel.dispose();
    match reply {
        Some(reply) if reply.content_str("status") == Some("ok") => Ok(()),
        Some(reply) => {
            debug!("[kernelctl] Execute reply: {}", reply.content);
            std::process::exit(1);
        }
        None => bail!("Kernel {} finished without an execute_reply", id),
    }
}
