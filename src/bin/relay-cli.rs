use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Parser)]
#[command(name = "relay-cli")]
#[command(about = "Command line client for the relay hub", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:3001")]
    url: String,

    /// Status access token, for the detailed view from remote hosts.
    #[arg(short, long, env = "RELAY_ACCESS_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show relay status
    Status,
    /// Register under an id and print every message received
    Listen {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "tv")]
        kind: String,
    },
    /// Register, send one message and print the acknowledgment
    Send {
        #[arg(long, default_value = "relay-cli")]
        id: String,
        #[arg(long, default_value = "panel")]
        kind: String,
        /// Target client ids (repeatable)
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
        /// Payload as JSON, e.g. '{"type":"alert","level":"info","message":"hi"}'
        #[arg(long)]
        payload: String,
    },
}

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => status(&cli.url, cli.token.as_deref()).await,
        Commands::Listen { id, kind } => listen(&cli.url, &id, &kind).await,
        Commands::Send {
            id,
            kind,
            targets,
            payload,
        } => {
            let payload: Value = serde_json::from_str(&payload)?;
            send(&cli.url, &id, &kind, targets, payload).await
        }
    }
}

async fn status(url: &str, token: Option<&str>) -> Result<()> {
    let mut headers = HeaderMap::new();
    if let Some(token) = token {
        headers.insert("x-access-token", HeaderValue::from_str(token)?);
    }

    let res = reqwest::Client::new()
        .get(format!("{}/status", url.trim_end_matches('/')))
        .headers(headers)
        .send()
        .await?;

    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: relay returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn ws_url(url: &str) -> String {
    let base = url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws", base)
}

fn frame(event: &str, data: Value) -> Message {
    Message::text(json!({ "event": event, "data": data }).to_string())
}

async fn listen(url: &str, id: &str, kind: &str) -> Result<()> {
    let (mut ws, _) = connect_async(ws_url(url)).await?;
    ws.send(frame("register", json!({ "type": kind, "id": id }))).await?;

    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(text.as_str())?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

async fn send(url: &str, id: &str, kind: &str, targets: Vec<String>, payload: Value) -> Result<()> {
    let (mut ws, _) = connect_async(ws_url(url)).await?;
    ws.send(frame("register", json!({ "type": kind, "id": id }))).await?;
    ws.send(frame("send", json!({ "target": targets, "payload": payload })))
        .await?;

    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg? {
            let value: Value = serde_json::from_str(text.as_str())?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            if value["event"] == "message_sent" {
                break;
            }
        }
    }
    let _ = ws.close(None).await;
    Ok(())
}
