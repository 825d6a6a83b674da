use anyhow::Result;
use clap::Parser;
use rustdialer::{
    call::{CallSessionOrchestrator, NullAudioDevice},
    config::{Cli, Command, Config},
    signaling::HeadlessSignalingGateway,
    telephony::TwilioClient,
};
use std::{fs::File, sync::Arc, time::Duration};
use tokio::select;
use tracing::{error, info, level_filters::LevelFilter, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.conf {
        Some(ref conf) if std::path::Path::new(conf).exists() => Config::load(conf)?,
        _ => Config::default(),
    };
    config.telephony.apply_env();

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _guard = if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
        Some(guard)
    } else {
        log_fmt.try_init().ok();
        None
    };

    config.telephony.validate()?;

    let Command::Dial { number } = cli.command;

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = CallSessionOrchestrator::builder()
        .config(config.orchestrator.clone())
        .from_number(config.telephony.from_number.clone())
        .callback_url(config.telephony.callback_url.clone())
        .signaling(Arc::new(HeadlessSignalingGateway::new(events_tx)))
        .telephony(Arc::new(TwilioClient::new(&config.telephony)))
        .audio_device(Arc::new(NullAudioDevice))
        .build()?;
    tokio::spawn(orchestrator.clone().serve(events_rx));

    let mut state_rx = orchestrator.subscribe();
    let session = orchestrator.start_outgoing_call(&number)?;
    info!(session_id = session.id, number, "dialing");

    loop {
        select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(snapshot) = state_rx.borrow_and_update().clone() else {
                    continue;
                };
                info!(
                    session_id = snapshot.id,
                    state = ?snapshot.state,
                    remote_call_id = snapshot.remote_call_id.as_deref().unwrap_or_default(),
                    "call state changed"
                );
                if snapshot.state.is_terminal() {
                    if let Some(reason) = snapshot.failure_reason() {
                        error!(retryable = reason.is_retryable(), "call failed: {}", reason);
                        if reason.requires_credentials() {
                            warn!("check TWILIO_ACCOUNT_SID and TWILIO_AUTH_TOKEN");
                        }
                    }
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received CTRL+C, hanging up");
                orchestrator.end_call();
            }
        }
    }

    orchestrator.shutdown();
    orchestrator.drain(Duration::from_secs(5)).await;
    Ok(())
}
