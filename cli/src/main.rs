use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use frames::Frame;
use futures_util::{SinkExt, StreamExt};
use project_shell::analytics::{BucketSize, Column, render_table};
use project_shell::config::ConfigError;
use project_shell::export::{ExportError, ExportFile, export_bot_responses};
use project_shell::net::FrameBackend;
use project_shell::net::frame_backend::Outbound;
use project_shell::roles::{RoleData, RoleEditor, RoleError};
use project_shell::{MountOptions, Navigator, Phase, ShellConfig, SubscriptionId, WorkspaceController};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket send failed: {0}")]
    WsSend(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket receive failed: {0}")]
    WsRecv(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket closed")]
    WsClosed,
    #[error("frame decode failed: {0}")]
    Decode(#[from] frames::CodecError),
    #[error("timed out waiting for websocket frame")]
    Timeout,
    #[error("server returned error for {method}: {message}")]
    ServerError { method: String, message: String },
    #[error("workspace {workspace_id} unavailable ({code})")]
    NotFound { workspace_id: String, code: &'static str },
    #[error(transparent)]
    Role(#[from] RoleError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "project-shell", about = "Project workspace shell over the frame protocol")]
struct Cli {
    #[arg(long, env = "SHELL_WS_URL", default_value = "ws://127.0.0.1:3000/api/ws")]
    ws_url: String,

    #[arg(long, env = "SHELL_WS_TICKET")]
    ticket: Option<String>,

    /// Seconds to wait for any single frame.
    #[arg(long, env = "SHELL_TIMEOUT_SECS", default_value_t = 15)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a project workspace and print its context once ready.
    Open(OpenArgs),
    /// Download every bot response of a project as JSON.
    ExportResponses(ExportArgs),
    Roles(RolesCommand),
    /// Format an analytics table read from a JSON file (offline).
    RenderTable(RenderTableArgs),
}

#[derive(Args, Debug)]
struct OpenArgs {
    project_id: String,

    #[arg(long)]
    language: Option<String>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    project_id: String,

    #[arg(long, default_value = ".")]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct RolesCommand {
    #[command(subcommand)]
    command: RolesSubcommand,
}

#[derive(Subcommand, Debug)]
enum RolesSubcommand {
    List,
    Save {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long = "child")]
        children: Vec<String>,
    },
    Delete {
        name: String,
        #[arg(long)]
        fallback: String,
    },
}

#[derive(Args, Debug)]
struct RenderTableArgs {
    /// JSON file with `{"columns": [...], "rows": [...]}`.
    input: PathBuf,

    #[arg(long, default_value = "day")]
    bucket: BucketSize,
}

#[derive(Deserialize)]
struct TableInput {
    columns: Vec<Column>,
    #[serde(default)]
    rows: Vec<Map<String, Value>>,
}

/// Navigator that records where the shell wanted to go.
#[derive(Debug, Default)]
struct CliNavigator {
    redirects: Vec<String>,
}

impl Navigator for CliNavigator {
    fn redirect(&mut self, path: &str) {
        info!(%path, "redirect");
        self.redirects.push(path.to_owned());
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs);

    match cli.command {
        Command::Open(args) => {
            let (session, backend) = Session::connect(&cli.ws_url, cli.ticket.as_deref(), timeout).await?;
            run_open(session, backend, args).await
        }
        Command::ExportResponses(args) => {
            let (session, backend) = Session::connect(&cli.ws_url, cli.ticket.as_deref(), timeout).await?;
            run_export(session, backend, args).await
        }
        Command::Roles(roles) => {
            let (session, backend) = Session::connect(&cli.ws_url, cli.ticket.as_deref(), timeout).await?;
            run_roles(session, backend, roles).await
        }
        Command::RenderTable(args) => run_render_table(&args),
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// One websocket connection feeding a [`FrameBackend`].
struct Session {
    stream: WsStream,
    outbound: Outbound,
    timeout: Duration,
}

impl Session {
    async fn connect(url: &str, ticket: Option<&str>, timeout: Duration) -> Result<(Self, FrameBackend), CliError> {
        let url = ws_url(url, ticket);
        let (stream, _) = connect_async(url.as_str()).await.map_err(|error| CliError::WsConnect(Box::new(error)))?;
        info!(url = %url.split('?').next().unwrap_or_default(), "connected");
        let (backend, outbound) = FrameBackend::channel();
        Ok((Self { stream, outbound, timeout }, backend))
    }

    /// Write every queued request to the socket.
    async fn flush(&mut self) -> Result<(), CliError> {
        while let Ok(Some(bytes)) = self.outbound.try_next() {
            self.stream
                .send(Message::Binary(bytes.into()))
                .await
                .map_err(|error| CliError::WsSend(Box::new(error)))?;
        }
        Ok(())
    }

    /// Flush, then apply the next inbound frame.
    async fn pump(&mut self, backend: &mut FrameBackend) -> Result<Option<SubscriptionId>, CliError> {
        self.flush().await?;
        match recv_next(&mut self.stream, self.timeout).await {
            Ok(frame) => Ok(backend.accept(frame)),
            Err(error) => {
                let lost = backend.fail_pending(&error.to_string());
                debug!(lost = lost.len(), "subscriptions unready after receive failure");
                Err(error)
            }
        }
    }

    /// Pump until no call is waiting for a reply.
    async fn settle(&mut self, backend: &mut FrameBackend) -> Result<(), CliError> {
        while backend.pending_calls() > 0 {
            self.pump(backend).await?;
        }
        Ok(())
    }

    async fn close(mut self) -> Result<(), CliError> {
        self.flush().await?;
        self.stream.close(None).await.map_err(|error| CliError::WsSend(Box::new(error)))
    }
}

fn ws_url(base: &str, ticket: Option<&str>) -> String {
    match ticket {
        Some(ticket) if base.contains('?') => format!("{base}&ticket={ticket}"),
        Some(ticket) => format!("{base}?ticket={ticket}"),
        None => base.to_owned(),
    }
}

async fn recv_next(stream: &mut WsStream, timeout: Duration) -> Result<Frame, CliError> {
    let fut = async {
        loop {
            let Some(message) = stream.next().await else {
                return Err(CliError::WsClosed);
            };
            match message.map_err(|error| CliError::WsRecv(Box::new(error)))? {
                Message::Binary(bytes) => {
                    return frames::decode_frame(&bytes).map_err(CliError::from);
                }
                Message::Close(_) => return Err(CliError::WsClosed),
                _ => {}
            }
        }
    };

    tokio::time::timeout(timeout, fut).await.map_err(|_| CliError::Timeout)?
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn run_open(mut session: Session, backend: FrameBackend, args: OpenArgs) -> Result<(), CliError> {
    let config = ShellConfig::from_env()?;
    let mut shell = WorkspaceController::new(config, backend, CliNavigator::default());
    let options = MountOptions { user_present: true, working_language: args.language };

    let mut phase = shell.mount(&args.project_id, options);
    while phase == Phase::Subscribing {
        if let Some(changed) = session.pump(shell.backend_mut()).await? {
            phase = shell.on_handle_change(changed);
        }
    }

    if phase == Phase::NotFound {
        let code = shell.not_found().map_or("E_UNKNOWN", |reason| reason.error_code());
        print_json(&json!({ "phase": phase, "redirects": shell.navigator().redirects }))?;
        shell.unmount();
        session.close().await?;
        return Err(CliError::NotFound { workspace_id: args.project_id, code });
    }

    // Wait for intent/entity discovery so the printed context is complete.
    session.settle(shell.backend_mut()).await?;
    let context = shell.context();
    print_json(&json!({
        "phase": shell.phase(),
        "offers_open_chat": shell.offers_open_chat(),
        "chat_pane": shell.chat_pane().geometry(),
        "context": context,
    }))?;

    shell.unmount();
    session.close().await
}

async fn run_export(mut session: Session, mut backend: FrameBackend, args: ExportArgs) -> Result<(), CliError> {
    let slot: Rc<RefCell<Option<Result<ExportFile, ExportError>>>> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    export_bot_responses(&mut backend, &args.project_id, move |file| *sink.borrow_mut() = Some(file));
    session.settle(&mut backend).await?;

    let file = slot.borrow_mut().take().ok_or_else(|| CliError::ServerError {
        method: project_shell::export::BOT_RESPONSES_METHOD.to_owned(),
        message: "no reply".to_owned(),
    })??;
    let path = file.write_to(&args.out)?;
    println!("{}", path.display());
    session.close().await
}

async fn run_roles(mut session: Session, mut backend: FrameBackend, roles: RolesCommand) -> Result<(), CliError> {
    let route_name = match &roles.command {
        RolesSubcommand::List => None,
        RolesSubcommand::Save { name, .. } | RolesSubcommand::Delete { name, .. } => Some(name.as_str()),
    };
    let mut editor = RoleEditor::new(route_name);
    let mut navigator = CliNavigator::default();

    editor.request_roles(&mut backend);
    session.settle(&mut backend).await?;
    editor.apply_outcomes(&mut navigator);
    fail_on_role_error(&editor)?;

    match roles.command {
        RolesSubcommand::List => {
            print_json(&json!(editor.options()))?;
        }
        RolesSubcommand::Save { name, description, children } => {
            // Saving an unknown name creates it from the blank draft.
            if editor.role().is_none() {
                editor = RoleEditor::new(None);
                editor.load(Vec::new());
            }
            editor.submit(&mut backend, RoleData { name, description, children, deletable: true })?;
            session.settle(&mut backend).await?;
            editor.apply_outcomes(&mut navigator);
            fail_on_role_error(&editor)?;
            print_json(&json!({ "saved": editor.saved(), "redirects": navigator.redirects }))?;
        }
        RolesSubcommand::Delete { fallback, .. } => {
            editor.confirm_delete(&mut backend, &fallback)?;
            session.settle(&mut backend).await?;
            editor.apply_outcomes(&mut navigator);
            fail_on_role_error(&editor)?;
            print_json(&json!({ "redirects": navigator.redirects }))?;
        }
    }
    session.close().await
}

fn fail_on_role_error(editor: &RoleEditor) -> Result<(), CliError> {
    match editor.last_error() {
        Some(error) => Err(CliError::ServerError { method: error.method.clone(), message: error.message.clone() }),
        None => Ok(()),
    }
}

fn run_render_table(args: &RenderTableArgs) -> Result<(), CliError> {
    let raw = std::fs::read_to_string(&args.input)
        .map_err(|source| CliError::Read { path: args.input.clone(), source })?;
    let input: TableInput = serde_json::from_str(&raw)?;
    debug!(columns = input.columns.len(), rows = input.rows.len(), "rendering table");

    let table = render_table(&input.columns, &input.rows, args.bucket);
    println!("{}", table.headers.join("\t"));
    for row in &table.rows {
        println!("{}", row.join("\t"));
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_is_appended_to_url() {
        assert_eq!(ws_url("ws://h/api/ws", Some("t1")), "ws://h/api/ws?ticket=t1");
        assert_eq!(ws_url("ws://h/api/ws?v=2", Some("t1")), "ws://h/api/ws?v=2&ticket=t1");
        assert_eq!(ws_url("ws://h/api/ws", None), "ws://h/api/ws");
    }

    #[test]
    fn socket_errors_name_the_failing_direction() {
        use tokio_tungstenite::tungstenite::Error as WsError;

        let send = CliError::WsSend(Box::new(WsError::ConnectionClosed));
        assert!(send.to_string().starts_with("websocket send failed"));
        let recv = CliError::WsRecv(Box::new(WsError::AlreadyClosed));
        assert!(recv.to_string().starts_with("websocket receive failed"));
    }

    #[test]
    fn cli_parses_roles_delete() {
        let cli = Cli::try_parse_from(["project-shell", "roles", "delete", "editor", "--fallback", "viewer"])
            .expect("parses");
        match cli.command {
            Command::Roles(RolesCommand { command: RolesSubcommand::Delete { name, fallback } }) => {
                assert_eq!(name, "editor");
                assert_eq!(fallback, "viewer");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_bucket_size() {
        let cli = Cli::try_parse_from(["project-shell", "render-table", "t.json", "--bucket", "hour"]).expect("parses");
        assert!(matches!(cli.command, Command::RenderTable(RenderTableArgs { bucket: BucketSize::Hour, .. })));
    }

    #[test]
    fn table_input_defaults_rows() {
        let input: TableInput =
            serde_json::from_str(r#"{"columns": [{"header": "Date", "accessor": "date"}]}"#).expect("parses");
        assert!(input.rows.is_empty());
        assert!(!input.columns[0].temporal);
    }
}
