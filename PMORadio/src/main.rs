mod console;
mod logging;

use std::sync::Arc;

use anyhow::Result;
use console::ConsoleCommand;
use pmoconfig::get_config;
use pmoplayer::{PlaybackOrchestrator, PlayerConfigExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = get_config();
    logging::init(&config);

    let settings = config.get_player_settings()?;
    info!(
        config_file = %config.file().display(),
        volume = %settings.initial_volume,
        "📻 Starting PMORadio"
    );
    let orchestrator = Arc::new(PlaybackOrchestrator::new(settings));

    // Les événements sont imprimés en JSON, une ligne par événement
    let events = orchestrator.subscribe();
    std::thread::spawn(move || {
        for event in events.iter() {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(err) => warn!(error = %err, "Failed to encode event"),
            }
        }
    });

    // Un seul écouteur de Ctrl+C pour toute la durée de vie du programme
    let stop_token = CancellationToken::new();
    let stop_token_ctrl_c = stop_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received");
                stop_token_ctrl_c.cancel();
            }
            Err(err) => error!(error = %err, "Failed to listen for Ctrl+C"),
        }
    });

    info!("✅ PMORadio is ready, type commands on stdin (quit to exit)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = stop_token.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("End of input");
                break;
            }
            Err(err) => {
                error!(error = %err, "Failed to read console input");
                break;
            }
        };

        match console::parse(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Quit)) => break,
            Ok(Some(command)) => {
                if let Err(err) = execute(&orchestrator, command).await {
                    println!("{}", serde_json::json!({ "error": err.to_string() }));
                }
            }
            Err(err) => println!("{}", serde_json::json!({ "error": err.to_string() })),
        }
    }

    orchestrator.shutdown().await?;
    info!("👋 PMORadio stopped");
    Ok(())
}

async fn execute(orchestrator: &PlaybackOrchestrator, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Play(url) => orchestrator.play(&url).await?,
        ConsoleCommand::Pause => orchestrator.pause().await?,
        ConsoleCommand::Resume => orchestrator.resume().await?,
        ConsoleCommand::Stop => orchestrator.stop().await?,
        ConsoleCommand::Volume(volume) => orchestrator.set_volume(volume).await?,
        ConsoleCommand::Device(device) => orchestrator.set_output_device(device).await?,
        ConsoleCommand::Status => {
            let status = orchestrator.status().await;
            println!("{}", serde_json::to_string(&status)?);
        }
        ConsoleCommand::Quit => {}
    }
    Ok(())
}
