use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chat_id_bot::shutdown::listen_for_os_signals;
use chat_id_bot::web::{self, WebState};
use chat_id_bot::{BotApi, Config, Router, ShutdownSignal, Supervisor, TeloxideClient};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(directive: &str) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
  dotenv::dotenv().ok();

  let cfg = match Config::from_env() {
    Ok(cfg) => cfg,
    Err(e) => {
      init_logging("info");
      error!("Invalid configuration: {}", e);
      return ExitCode::from(1);
    }
  };
  init_logging(cfg.log_directive());

  match run(cfg).await {
    Ok(code) => code,
    Err(e) => {
      error!("{:#}", e);
      ExitCode::from(1)
    }
  }
}

async fn run(cfg: Config) -> Result<ExitCode> {
  info!(
    bot_id = cfg.bot_id(),
    environment = cfg.environment.as_str(),
    "Bot initializing..."
  );

  let addr = cfg.bind_address();
  let listener = web::bind(&addr)
    .await
    .with_context(|| format!("cannot bind status server to {addr}"))?;

  let signal = ShutdownSignal::new();
  listen_for_os_signals(signal.clone());

  let supervisor = Supervisor::new(cfg.supervisor_settings(), signal.clone());
  let handle = supervisor.handle();
  supervisor
    .start(
      || TeloxideClient::connect(&cfg).map(|client| Arc::new(client) as Arc<dyn BotApi>),
      Router::new(),
    )
    .await
    .context("bot startup failed")?;

  let web_state = WebState::new(handle.clone(), cfg.environment);
  let server = tokio::spawn({
    let signal = signal.clone();
    async move {
      if let Err(e) = web::serve(listener, web_state, signal).await {
        error!(error = %e, "Status server failed");
      }
    }
  });

  tokio::select! {
    _ = signal.wait() => info!("Shutting down"),
    _ = handle.failed() => warn!("Polling gave up, shutting down"),
  }
  supervisor.stop().await;

  if let Err(e) = server.await {
    warn!(error = %e, "Status server task panicked");
  }

  if handle.is_fatal() {
    return Ok(ExitCode::from(2));
  }
  Ok(ExitCode::SUCCESS)
}
