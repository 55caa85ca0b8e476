mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use janus_client::{
    MediaOptions, PeerRegistry, RtcEngine, Session, SessionConfig, VideoRoom, WebRtcEngine,
    WebRtcEngineConfig,
};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initialize logging")?;

    let session = Session::new(&cli.url, SessionConfig::default())?;
    let peers = PeerRegistry::new();

    let outcome = run(&cli, &session, &peers).await;

    session.destroy().await;
    let closed = peers.close_all().await;
    info!(closed, "teardown complete");
    outcome
}

async fn run(cli: &Cli, session: &Session, peers: &PeerRegistry) -> Result<()> {
    let session_id = session.create().await.context("create gateway session")?;
    info!(session_id, url = %cli.url, "session ready");
    let room = VideoRoom::new(session.clone(), cli.room);

    let publisher_engine = Arc::new(
        WebRtcEngine::new(
            WebRtcEngineConfig::default()
                .with_ice_servers(cli.ice_servers())
                .sending(true, false),
        )
        .await?,
    );
    peers.register("publisher", Arc::clone(&publisher_engine) as Arc<dyn RtcEngine>);

    let media = MediaOptions::default();
    let publisher = room
        .publish(&cli.display, &*publisher_engine, media)
        .await
        .context("publish into room")?;
    for existing in &publisher.publishers {
        info!(
            id = existing.id,
            display = existing.display.as_deref().unwrap_or(""),
            "publisher in room"
        );
    }

    let mut subscriber_engine = None;
    match publisher.publishers.first() {
        Some(first) if cli.subscribe => {
            let engine = Arc::new(
                WebRtcEngine::new(WebRtcEngineConfig::default().with_ice_servers(cli.ice_servers()))
                    .await?,
            );
            peers.register("subscriber", Arc::clone(&engine) as Arc<dyn RtcEngine>);
            let mut subscription = room
                .subscribe(&*engine, first.id)
                .await
                .with_context(|| format!("subscribe to feed {}", first.id))?;
            tokio::spawn(async move {
                while let Some(track) = subscription.next_track().await {
                    info!(kind = ?track.kind, track_id = %track.track_id, "receiving track");
                }
            });
            subscriber_engine = Some(engine);
        }
        None if cli.subscribe => warn!(room = cli.room, "no publisher to subscribe to"),
        _ => {}
    }

    info!(duration_secs = cli.duration_secs, "exchanging media");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listen for ctrl-c")?;
            info!("interrupted");
        }
        _ = tokio::time::sleep(cli.duration()) => {}
    }

    if let Some(engine) = subscriber_engine {
        info!(packets = engine.received_packets(), "remote media drained");
    }
    Ok(())
}
