//! Remote command relay with a browser operator console.
//!
//! Run with: cargo run -p relay-server -- --port 4444
//!
//! Agents connect to the relay port; open http://localhost:3000 to watch
//! them and send commands.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{Router, response::Html, routing::get};
use clap::Parser;
use relay_core::{OperatorCommand, Port, RelayConfig};
use relay_session::RelayServer;
use relay_transport::websocket::create_operator_router;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Operator commands buffered between the console and the relay.
const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Start accepting agents on this port right away.
    #[arg(short, long, env = "RELAY_PORT")]
    port: Option<Port>,

    /// Address of the operator console.
    #[arg(long, env = "RELAY_OPERATOR_ADDR", default_value = "127.0.0.1:3000")]
    operator_addr: SocketAddr,

    /// TOML file with relay settings.
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RelayConfig> {
    let Some(path) = path else {
        return Ok(RelayConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    let server = RelayServer::new(config);

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let runner = tokio::spawn({
        let server = server.clone();
        async move { server.run(command_rx).await }
    });

    if let Some(port) = args.port {
        command_tx
            .send(OperatorCommand::Start { port })
            .await
            .context("Relay command queue closed")?;
    }

    let sessions = {
        let server = server.clone();
        Arc::new(move || server.sessions())
    };
    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_operator_router(server.events(), command_tx, sessions));

    let listener = tokio::net::TcpListener::bind(args.operator_addr)
        .await
        .with_context(|| format!("Failed to bind operator console on {}", args.operator_addr))?;
    tracing::info!("Operator console on http://{}", args.operator_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {e}");
            }
        })
        .await
        .context("Operator console failed")?;

    server.stop_listening().await;
    runner.abort();
    tracing::info!("Relay shut down");
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Relay Console</title>
    <style>
        body { margin: 0; padding: 20px; background: #1e1e1e; color: #d4d4d4; font-family: system-ui, sans-serif; }
        h1 { color: #fff; margin: 0 0 10px; }
        #layout { display: flex; gap: 20px; height: calc(100vh - 110px); }
        #sessions { width: 320px; overflow-y: auto; }
        .session { padding: 8px; border: 1px solid #333; margin-bottom: 6px; cursor: pointer; }
        .session.selected { border-color: #4a4; }
        #main { flex: 1; display: flex; flex-direction: column; }
        #output { flex: 1; background: #111; padding: 10px; overflow-y: auto; white-space: pre-wrap; font-family: Menlo, Monaco, monospace; font-size: 13px; }
        .meta { color: #888; }
        .err { color: #d66; }
        form { display: flex; gap: 8px; margin-top: 8px; }
        input { background: #111; color: #d4d4d4; border: 1px solid #333; padding: 6px; }
        #command { flex: 1; }
    </style>
</head>
<body>
    <h1>Relay Console</h1>
    <form id="listen">
        <input id="port" type="number" min="1" max="65535" placeholder="port" />
        <button>Start</button>
        <button type="button" id="stop">Stop</button>
        <span class="meta" id="status">Connecting...</span>
    </form>
    <div id="layout">
        <div id="sessions"></div>
        <div id="main">
            <div id="output"></div>
            <form id="send">
                <input id="command" placeholder="command for selected session" />
                <button>Send</button>
                <button type="button" id="drop">Disconnect</button>
            </form>
        </div>
    </div>

    <script>
        const sessions = new Map();
        const output = document.getElementById('output');
        const list = document.getElementById('sessions');
        const status = document.getElementById('status');
        let selected = null;
        let ws;

        function log(text, cls) {
            const line = document.createElement('div');
            if (cls) line.className = cls;
            line.textContent = text;
            output.appendChild(line);
            output.scrollTop = output.scrollHeight;
        }

        function render() {
            list.innerHTML = '';
            for (const [id, s] of sessions) {
                const item = document.createElement('div');
                item.className = 'session' + (id === selected ? ' selected' : '');
                item.textContent = `${s.identity.username}@${s.identity.hostname} (${s.identity.os}) ${s.remote_addr}`;
                item.onclick = () => { selected = id; render(); };
                list.appendChild(item);
            }
        }

        function send(command) {
            if (ws && ws.readyState === WebSocket.OPEN) ws.send(JSON.stringify(command));
        }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws`);
            ws.onopen = () => { status.textContent = 'Console connected'; };
            ws.onclose = () => {
                status.textContent = 'Console disconnected - reconnecting...';
                sessions.clear();
                render();
                setTimeout(connect, 2000);
            };
            ws.onmessage = (msg) => {
                const e = JSON.parse(msg.data);
                switch (e.event) {
                    case 'sessions':
                        sessions.clear();
                        for (const s of e.sessions) sessions.set(s.session_id, s);
                        render();
                        break;
                    case 'started': status.textContent = `Listening on ${e.port}`; break;
                    case 'stopped': status.textContent = 'Stopped'; sessions.clear(); render(); break;
                    case 'start-error': log(`Start failed: ${e.reason}`, 'err'); break;
                    case 'connected': sessions.set(e.session_id, e); render(); log(`+ ${e.session_id}`, 'meta'); break;
                    case 'disconnected': sessions.delete(e.session_id); render(); log(`- ${e.session_id}`, 'meta'); break;
                    case 'output': log(e.text); break;
                    case 'command-acknowledged': log(`$ ${e.command}`, 'meta'); break;
                    case 'client-error': log(`${e.session_id}: ${e.message}`, 'err'); break;
                    case 'command-rejected': log(e.message, 'err'); break;
                }
            };
        }

        document.getElementById('listen').onsubmit = (ev) => {
            ev.preventDefault();
            send({ type: 'start', port: Number(document.getElementById('port').value) });
        };
        document.getElementById('stop').onclick = () => send({ type: 'stop' });
        document.getElementById('send').onsubmit = (ev) => {
            ev.preventDefault();
            const input = document.getElementById('command');
            if (selected && input.value) {
                send({ type: 'send_command', session_id: selected, command: input.value });
                input.value = '';
            }
        };
        document.getElementById('drop').onclick = () => {
            if (selected) send({ type: 'disconnect_session', session_id: selected });
        };

        connect();
    </script>
</body>
</html>
"#;
