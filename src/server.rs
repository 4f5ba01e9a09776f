//! Local widget panel: a small axum app serving the chat page, a command
//! endpoint feeding the orchestrator, and an SSE stream of agent events.
//! With `--mock` it also hosts stand-in completion/retrieval endpoints so the
//! whole loop runs without external services.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::orchestrator::AgentEvent;
use crate::types::ActionKind;

/// Messages from the panel to the main control loop.
#[derive(Debug)]
pub enum ControlMessage {
    Send(String),
    Reset,
}

impl AgentEvent {
    fn to_sse_event(&self) -> Event {
        match self {
            AgentEvent::Message { role, content } => Event::default().event("message").data(
                json!({
                    "role": match role {
                        crate::types::ChatRole::User => "user",
                        crate::types::ChatRole::Assistant => "assistant",
                        crate::types::ChatRole::System => "system",
                    },
                    "content": content,
                })
                .to_string(),
            ),
            AgentEvent::Thinking => Event::default().event("thinking").data("{}"),
            AgentEvent::ActionResult {
                kind,
                target,
                success,
            } => Event::default().event("action").data(
                json!({
                    "kind": match kind {
                        ActionKind::Click => "click",
                        ActionKind::Highlight => "highlight",
                        ActionKind::Retrieve => "retrieve",
                    },
                    "target": target,
                    "success": success,
                })
                .to_string(),
            ),
            AgentEvent::TurnError { message } => Event::default()
                .event("turn_error")
                .data(json!({ "message": message }).to_string()),
            AgentEvent::Ready => Event::default().event("ready").data("{}"),
        }
    }
}

#[derive(Clone)]
struct AppState {
    control_tx: mpsc::Sender<ControlMessage>,
    event_tx: broadcast::Sender<AgentEvent>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Start the panel server. Scans a few ports upward when the preferred one is
/// taken; returns the control channel, the event sender and the bound port.
pub async fn start_server(
    preferred_port: u16,
    mock_backends: bool,
) -> std::io::Result<(
    mpsc::Receiver<ControlMessage>,
    broadcast::Sender<AgentEvent>,
    u16,
)> {
    let (control_tx, control_rx) = mpsc::channel::<ControlMessage>(16);
    let (event_tx, _) = broadcast::channel::<AgentEvent>(64);

    let state = Arc::new(AppState {
        control_tx,
        event_tx: event_tx.clone(),
    });

    let mut app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/reset", post(reset_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { axum::http::StatusCode::NO_CONTENT }),
        );
    if mock_backends {
        app = app
            .route("/api/chat", post(mock_chat_handler))
            .route("/tenants/{tenant}/retrieval", get(mock_retrieval_handler));
    }
    let app = app.with_state(state);

    let mut bound = None;
    for port in preferred_port..preferred_port.saturating_add(10) {
        match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                bound = Some((listener, port));
                break;
            }
            Err(_) => continue,
        }
    }
    let Some((listener, port)) = bound else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no free port for the widget panel",
        ));
    };

    info!("widget panel at http://127.0.0.1:{port}");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "panel server stopped");
        }
    });

    Ok((control_rx, event_tx, port))
}

async fn index_handler() -> Html<&'static str> {
    Html(PANEL_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> &'static str {
    let _ = state
        .control_tx
        .send(ControlMessage::Send(payload.command))
        .await;
    "ok"
}

async fn reset_handler(State(state): State<Arc<AppState>>) -> &'static str {
    let _ = state.control_tx.send(ControlMessage::Reset).await;
    "ok"
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<AgentEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            Err(_) => None,
        });
    Sse::new(stream)
}

/// Stand-in completion endpoint, mirroring the real backend's shape.
async fn mock_chat_handler(Json(_payload): Json<serde_json::Value>) -> Json<serde_json::Value> {
    Json(json!({
        "content": "I'm here to help you find your way around this site. \
                    Try asking me to highlight something, or type `retrieve <topic>` \
                    to search the document corpus."
    }))
}

/// Stand-in retrieval endpoint with a tiny canned corpus.
async fn mock_retrieval_handler(Path(_tenant): Path<String>) -> Json<serde_json::Value> {
    Json(json!([
        {
            "id": "chunk-1",
            "document_id": "policy-guide",
            "content": "Tenant insurance covers personal property against fire, theft and water damage, up to the limits on your policy schedule.",
            "score": 0.91
        },
        {
            "id": "chunk-2",
            "document_id": "policy-guide",
            "content": "Claims can be filed online from the Claims page; most claims are acknowledged within one business day.",
            "score": 0.84
        },
        {
            "id": "chunk-3",
            "document_id": "terms",
            "content": "You may cancel your policy at any time; cancellation takes effect 30 days after notice is received.",
            "score": 0.77
        }
    ]))
}

const PANEL_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Pagemate</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #f4fafe;
    color: #0b3668;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 18px 28px;
    border-bottom: 1px solid #d7ecfa;
    background: #fff;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 18px; font-weight: 600; color: #074780; }
  header .dot {
    width: 8px; height: 8px;
    border-radius: 50%;
    background: #22c55e;
    animation: pulse 2s infinite;
  }
  header .dot.busy { background: #f59e0b; }
  header button {
    margin-left: auto;
    background: transparent;
    color: #0b5cc1;
    border: 1px solid #bae3f8;
    border-radius: 999px;
    padding: 6px 14px;
    font-size: 13px;
    cursor: pointer;
  }
  @keyframes pulse { 0%, 100% { opacity: 1; } 50% { opacity: 0.4; } }
  .main {
    flex: 1;
    display: flex;
    flex-direction: column;
    max-width: 760px;
    width: 100%;
    margin: 0 auto;
    padding: 20px 24px;
    gap: 14px;
    overflow: hidden;
  }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 8px; padding-right: 6px; }
  .entry {
    padding: 10px 12px;
    border-radius: 8px;
    font-size: 14px;
    line-height: 1.5;
    border: 1px solid #bae3f8;
    white-space: pre-wrap;
    animation: fadeIn 0.2s ease;
  }
  @keyframes fadeIn { from { opacity: 0; transform: translateY(4px); } to { opacity: 1; } }
  .entry.user { background: #fff; margin-left: auto; max-width: 80%; }
  .entry.assistant { background: #dff4ff; max-width: 80%; }
  .entry.action {
    background: rgba(171, 220, 246, 0.16);
    border-style: dashed;
    font-size: 12px;
    color: #074780;
  }
  .entry.error { background: #fff5f5; border-color: #f3b6b6; color: #c0392b; }
  .entry.thinking { background: rgba(171, 220, 246, 0.16); color: #6c8bab; font-size: 12px; }
  .role { display: block; font-size: 11px; color: #6c8bab; margin-bottom: 2px; }
  .input-area { display: flex; gap: 8px; }
  #cmd {
    flex: 1;
    background: #fff;
    border: 1px solid #bae3f8;
    border-radius: 8px;
    padding: 12px 14px;
    color: #0b3668;
    font-size: 15px;
    outline: none;
  }
  #cmd:focus { border-color: #0093f6; }
  #cmd:disabled { opacity: 0.5; }
  .input-area button {
    background: #0093f6;
    color: #fff;
    border: none;
    border-radius: 8px;
    padding: 12px 22px;
    font-size: 14px;
    font-weight: 600;
    cursor: pointer;
  }
  .input-area button:disabled { background: #9cc8e8; cursor: not-allowed; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>Pagemate</h1>
    <button onclick="resetTask()">New task</button>
  </header>
  <div class="main">
    <div id="log"></div>
    <div class="input-area">
      <input type="text" id="cmd" placeholder="Ask, or try: highlight &quot;Get a Quote&quot;" autofocus />
      <button id="send" onclick="send()">Send</button>
    </div>
  </div>
<script>
  const log = document.getElementById('log');
  const cmd = document.getElementById('cmd');
  const sendBtn = document.getElementById('send');
  const dot = document.getElementById('status-dot');
  let thinkingEntry = null;

  function addEntry(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
    return div;
  }

  function esc(s) { return s.replace(/</g, '&lt;'); }

  function setBusy(b) {
    cmd.disabled = b;
    sendBtn.disabled = b;
    dot.className = b ? 'dot busy' : 'dot';
    if (!b) cmd.focus();
  }

  async function send() {
    const text = cmd.value.trim();
    if (!text || cmd.disabled) return;
    cmd.value = '';
    setBusy(true);
    await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command: text}),
    });
  }

  async function resetTask() {
    log.innerHTML = '';
    await fetch('/reset', {method: 'POST'});
  }

  cmd.addEventListener('keydown', e => { if (e.key === 'Enter') send(); });

  const es = new EventSource('/events');

  es.addEventListener('message', e => {
    if (thinkingEntry) { thinkingEntry.remove(); thinkingEntry = null; }
    const d = JSON.parse(e.data);
    const who = d.role === 'user' ? 'You' : 'Pagemate';
    addEntry(d.role, '<span class="role">' + who + '</span>' + esc(d.content));
  });

  es.addEventListener('thinking', () => {
    if (!thinkingEntry) thinkingEntry = addEntry('thinking', 'Thinking…');
  });

  es.addEventListener('action', e => {
    const d = JSON.parse(e.data);
    const mark = d.success ? '✓' : '✗';
    addEntry('action', mark + ' ' + esc(d.kind.toUpperCase()) + ' ' + esc(d.target));
  });

  es.addEventListener('turn_error', e => {
    const d = JSON.parse(e.data);
    addEntry('error', esc(d.message));
  });

  es.addEventListener('ready', () => {
    if (thinkingEntry) { thinkingEntry.remove(); thinkingEntry = null; }
    setBusy(false);
  });
</script>
</body>
</html>
"##;
