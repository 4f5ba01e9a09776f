use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pagemate::backend::{HttpCompletionClient, HttpRetrievalClient};
use pagemate::cdp::{BrowserSession, CdpPage};
use pagemate::executor::ActionExecutor;
use pagemate::orchestrator::{AgentEvent, Orchestrator, OrchestratorConfig};
use pagemate::page::{PageDriver, PageEvent};
use pagemate::server::{self, ControlMessage};
use pagemate::spotlight::SpotlightManager;

/// On-page assistant: drives a live Chrome tab, resolves assistant directives
/// to page actions and keeps the widget panel in sync.
#[derive(Parser, Debug)]
#[command(name = "pagemate", version, about)]
struct Cli {
    /// Page to open in the driven tab on startup
    #[arg(long)]
    page: Option<String>,

    /// Chat completion endpoint
    #[arg(
        long,
        env = "PAGEMATE_CHAT_ENDPOINT",
        default_value = "https://pagemate.app/api/chat"
    )]
    chat_endpoint: String,

    /// Retrieval API base URL
    #[arg(
        long,
        env = "PAGEMATE_RETRIEVAL_BASE",
        default_value = "https://api.pagemate.app"
    )]
    retrieval_base: String,

    /// Tenant whose document corpus retrieval queries run against
    #[arg(long, env = "PAGEMATE_TENANT_ID", default_value = "demo")]
    tenant: String,

    /// Completion model name
    #[arg(long, env = "PAGEMATE_MODEL", default_value = "solar-pro2")]
    model: String,

    /// Widget panel port (scans upward when taken)
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Serve mock completion/retrieval endpoints locally and use them
    #[arg(long)]
    mock: bool,

    /// Do not send sanitized page HTML with completion calls
    #[arg(long)]
    no_page_html: bool,

    /// Conversation transcript file (defaults under the user cache dir)
    #[arg(long)]
    transcript: Option<PathBuf>,

    /// Start with an empty conversation and keep nothing on disk
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pagemate=info")),
        )
        .init();

    let cli = Cli::parse();

    let (mut control_rx, event_tx, port) = server::start_server(cli.port, cli.mock).await?;
    let (chat_endpoint, retrieval_base) = if cli.mock {
        (
            format!("http://127.0.0.1:{port}/api/chat"),
            format!("http://127.0.0.1:{port}"),
        )
    } else {
        (cli.chat_endpoint.clone(), cli.retrieval_base.clone())
    };

    info!("launching browser session");
    let session = tokio::task::spawn_blocking(BrowserSession::launch)
        .await
        .map_err(|e| anyhow::anyhow!("browser launch panicked: {e}"))??;

    if let Some(url) = cli.page.clone() {
        let tab = session.tab.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            tab.navigate_to(&url)?;
            tab.wait_for_element("body")?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("navigation panicked: {e}"))??;
    }

    let driver: Arc<dyn PageDriver> = CdpPage::new(session.tab.clone());
    let spotlight = Arc::new(SpotlightManager::new(driver.clone()));
    let retrieval = Arc::new(HttpRetrievalClient::new(retrieval_base, cli.tenant.clone()));
    let executor = ActionExecutor::new(driver.clone(), spotlight.clone(), retrieval);
    let completion = Arc::new(HttpCompletionClient::new(chat_endpoint));

    let transcript_path = if cli.ephemeral {
        None
    } else {
        cli.transcript.clone().or_else(|| {
            dirs::cache_dir().map(|dir| dir.join("pagemate").join("transcript.json"))
        })
    };

    let orchestrator = Arc::new(Orchestrator::new(
        driver.clone(),
        executor,
        spotlight,
        completion,
        event_tx.clone(),
        OrchestratorConfig {
            model: cli.model.clone(),
            send_page_html: !cli.no_page_html,
            transcript_path,
        },
    ));

    // Navigation watcher: a page change always wins over in-flight work.
    {
        let orchestrator = orchestrator.clone();
        let mut page_events = driver.subscribe();
        tokio::spawn(async move {
            loop {
                match page_events.recv().await {
                    Ok(PageEvent::Navigated { url }) => {
                        orchestrator.spawn_navigation_restart(url);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let _ = event_tx.send(AgentEvent::Ready);
    info!("pagemate ready, panel at http://127.0.0.1:{port}");

    while let Some(message) = control_rx.recv().await {
        match message {
            ControlMessage::Send(text) => orchestrator.spawn_user_turn(text),
            ControlMessage::Reset => orchestrator.reset().await,
        }
    }

    drop(session);
    Ok(())
}
