//! oxideterm-session: console front end for the session core.
//!
//! ```text
//! oxideterm-session [options] user@host[:port]
//!   -L port:host:port   local forward
//!   -R port:host:port   remote forward
//!   -D port             SOCKS proxy
//!   -i keyfile          authenticate with this key only
//!   -A                  forward the agent
//!   -C                  request compression
//!   -N                  no shell, forwards only
//! ```
//!
//! Prompts (host key, passwords) are answered on stdin. Once the shell is
//! up, stdin is relayed to it line by line and its output goes to
//! stdout/stderr. Logging goes to stderr, filtered by `RUST_LOG`.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use oxideterm_session::agent::IdentityRegistry;
use oxideterm_session::config::{SettingsStorage, TransportSettings};
use oxideterm_session::forwarding::PortForwardSpec;
use oxideterm_session::session::{SessionDeps, SessionEvent, ShellOutput, SshTransport};
use oxideterm_session::ssh::{
    AgentForwarding, FileKeyStore, HostProfile, KeyPolicy, KnownHostsStore, PromptBroker,
    PromptKind, PromptRequest, RusshEngine,
};

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (relay buffers, channel frames)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Key id used for the `-i` key file
const CLI_KEY_ID: i64 = 1;

#[derive(Debug, Parser)]
#[command(name = "oxideterm-session", version, about = "SSH session with port and agent forwarding")]
struct Cli {
    /// Target in user@host[:port] form
    #[arg(value_name = "DESTINATION")]
    destination: String,
    /// Local forward: listen on PORT here, connect to HOST:HOSTPORT from the server (repeatable)
    #[arg(short = 'L', value_name = "PORT:HOST:HOSTPORT", value_parser = parse_local, action = ArgAction::Append)]
    local: Vec<PortForwardSpec>,
    /// Remote forward: server listens on PORT, connections go to HOST:HOSTPORT here (repeatable)
    #[arg(short = 'R', value_name = "PORT:HOST:HOSTPORT", value_parser = parse_remote, action = ArgAction::Append)]
    remote: Vec<PortForwardSpec>,
    /// SOCKS proxy on a local PORT (repeatable)
    #[arg(short = 'D', value_name = "PORT", value_parser = parse_dynamic, action = ArgAction::Append)]
    dynamic: Vec<PortForwardSpec>,
    /// Authenticate with this private key only
    #[arg(short = 'i', value_name = "KEYFILE")]
    key_file: Option<String>,
    /// Forward the in-process agent to the server
    #[arg(short = 'A', action = ArgAction::SetTrue)]
    agent: bool,
    /// Request compression
    #[arg(short = 'C', action = ArgAction::SetTrue)]
    compression: bool,
    /// Do not start a shell, only run forwards
    #[arg(short = 'N', action = ArgAction::SetTrue)]
    no_session: bool,
}

impl Cli {
    fn forwards(&self) -> impl Iterator<Item = &PortForwardSpec> {
        self.local.iter().chain(&self.remote).chain(&self.dynamic)
    }
}

fn parse_triplet(text: &str) -> Result<(u16, String, u16), String> {
    let (source, rest) = text
        .split_once(':')
        .ok_or_else(|| format!("expected PORT:HOST:HOSTPORT, got {}", text))?;
    let (host, dest) = rest
        .rsplit_once(':')
        .ok_or_else(|| format!("expected PORT:HOST:HOSTPORT, got {}", text))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let source = source
        .parse::<u16>()
        .map_err(|_| format!("invalid port {}", source))?;
    let dest = dest.parse::<u16>().map_err(|_| format!("invalid port {}", dest))?;
    if host.is_empty() {
        return Err(format!("missing host in {}", text));
    }
    Ok((source, host.to_string(), dest))
}

fn parse_local(text: &str) -> Result<PortForwardSpec, String> {
    let (source, host, dest) = parse_triplet(text)?;
    Ok(PortForwardSpec::local(source, host, dest))
}

fn parse_remote(text: &str) -> Result<PortForwardSpec, String> {
    let (source, host, dest) = parse_triplet(text)?;
    Ok(PortForwardSpec::remote(source, host, dest))
}

fn parse_dynamic(text: &str) -> Result<PortForwardSpec, String> {
    let port = text
        .parse::<u16>()
        .map_err(|_| format!("invalid port {}", text))?;
    Ok(PortForwardSpec::dynamic(port))
}

/// Answer one prompt from a stdin line; EOF cancels it
async fn answer_prompt(request: PromptRequest, stdin: &mut BufReader<Stdin>) {
    let mut stderr = tokio::io::stderr();
    let question = match &request.title {
        Some(title) => format!("{}\n{} ", title, request.message),
        None => format!("{} ", request.message),
    };
    let question = match request.kind {
        PromptKind::Boolean => format!("{}(yes/no) ", question),
        PromptKind::Text { .. } => question,
    };
    let _ = stderr.write_all(question.as_bytes()).await;
    let _ = stderr.flush().await;

    let mut line = String::new();
    match stdin.read_line(&mut line).await {
        Ok(0) | Err(_) => request.cancel(),
        Ok(_) => {
            let line = line.trim_end_matches(['\r', '\n']);
            match request.kind {
                PromptKind::Boolean => {
                    let yes = matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes");
                    request.answer_boolean(yes);
                }
                PromptKind::Text { .. } => request.answer_text(line),
            }
        }
    }
}

/// Copy shell output to stdout/stderr until the shell closes
async fn pump_output(transport: Arc<SshTransport>) {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    loop {
        let written = match transport.read_output().await {
            Ok(ShellOutput::Stdout(data)) => {
                stdout.write_all(&data).await.and(stdout.flush().await)
            }
            Ok(ShellOutput::Stderr(data)) => {
                stderr.write_all(&data).await.and(stderr.flush().await)
            }
            Err(_) => break,
        };
        if let Err(e) = written {
            warn!("Local output failed: {}", e);
            break;
        }
    }
}

fn print_event(event: &SessionEvent) {
    if let SessionEvent::Transcript { line } = event {
        eprintln!("{}", line.text);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let mut profile = HostProfile::from_uri(&cli.destination).map_err(|e| e.to_string())?;
    profile.compression = cli.compression;
    profile.want_session = !cli.no_session;
    if cli.agent {
        profile.agent_forwarding = AgentForwarding::On;
    }

    let mut keys = FileKeyStore::new();
    if let Some(path) = &cli.key_file {
        keys = keys.with_key(CLI_KEY_ID, path, false);
        profile.key_policy = KeyPolicy::Specific { id: CLI_KEY_ID };
    }

    let settings = match SettingsStorage::new() {
        Ok(storage) => storage.load().await.unwrap_or_else(|e| {
            warn!("Ignoring unreadable transport settings: {}", e);
            TransportSettings::default()
        }),
        Err(e) => {
            warn!("No settings location: {}", e);
            TransportSettings::default()
        }
    };

    let (prompts, mut prompt_rx) = PromptBroker::new();
    let transport = Arc::new(SshTransport::new(
        profile,
        settings.clone(),
        SessionDeps {
            engine: Arc::new(RusshEngine::new(settings)),
            trust: Arc::new(KnownHostsStore::new()),
            prompts: Arc::new(prompts),
            keys: Arc::new(keys),
            identities: Arc::new(IdentityRegistry::new()),
        },
    ));
    for spec in cli.forwards() {
        transport.add_port_forward(spec.clone()).await;
    }

    let cols = std::env::var("COLUMNS").ok().and_then(|c| c.parse().ok()).unwrap_or(80);
    let rows = std::env::var("LINES").ok().and_then(|r| r.parse().ok()).unwrap_or(24);
    transport.set_dimensions(cols, rows, 0, 0).await;

    let mut events = transport.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin());

    let connect = transport.connect();
    tokio::pin!(connect);
    let connected = loop {
        tokio::select! {
            result = &mut connect => break result,
            Some(request) = prompt_rx.recv() => answer_prompt(request, &mut stdin).await,
            Ok(event) = events.recv() => print_event(&event),
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    connected.map_err(|e| e.to_string())?;

    let pump = transport
        .is_session_open()
        .then(|| tokio::spawn(pump_output(transport.clone())));

    let mut stdin_open = true;
    let mut line = String::new();
    loop {
        tokio::select! {
            Some(request) = prompt_rx.recv() => answer_prompt(request, &mut stdin).await,
            event = events.recv() => match event {
                Ok(SessionEvent::Disconnected { clean, reason }) => {
                    info!("Disconnected (clean: {}): {}", clean, reason);
                    break;
                }
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} session events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            read = stdin.read_line(&mut line), if stdin_open => {
                match read {
                    Ok(0) | Err(_) => {
                        stdin_open = false;
                        if transport.is_session_open() {
                            transport.close().await;
                        }
                    }
                    Ok(_) => {
                        if let Err(e) = transport.write(line.as_bytes()) {
                            warn!("Write to shell failed: {}", e);
                        }
                        line.clear();
                    }
                }
            }
        }
    }

    transport.close().await;
    if let Some(pump) = pump {
        let _ = pump.await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    oxideterm_session::init_logging();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("oxideterm-session: {}", e);
            ExitCode::FAILURE
        }
    }
}
