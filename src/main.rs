mod audio;
mod commands;
mod config;
mod console;
mod controller;
mod error;
mod events;
mod file_xfer;
mod lookup;
mod resampler;
mod rx_engine;
mod session;
mod stats;
mod tx_engine;
mod usrp_protocol;
mod vox;

use std::sync::Arc;

use clap::Parser;
use config::Config;
use stats::Stats;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::commands::UsrpSender;
use crate::controller::{ Controller, Station };
use crate::events::{ EventBus, UiCommand };
use crate::lookup::NoLookup;
use crate::rx_engine::{ RxEngine, RxOptions };
use crate::session::SessionContext;
use crate::tx_engine::TxEngine;
use crate::vox::Vox;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber
        ::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter
                ::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Config::parse();
    config.validate()?;
    let destinations = config.destinations()?;

    info!(
        call = %config.call,
        gateway = %config.gateway,
        tx_ports = ?config.tx_ports,
        rx = %config.rx_addr(),
        mode = %config.mode(),
        "🚀 usrp-client starting"
    );

    let stats = Stats::new();
    let shutdown = CancellationToken::new();
    let (events, events_rx) = EventBus::new(config.event_capacity, stats.clone());

    // Streams must outlive every task that feeds or drains them
    #[cfg(feature = "audio")]
    let (_devices, sink, source) = audio::cpal_backend::open(
        config.output_device.as_deref(),
        config.input_device.as_deref(),
        config.input_enabled(),
        config.sample_rate,
        config.chunk_samples()
    )?;
    #[cfg(not(feature = "audio"))]
    let (sink, source): (audio::AudioSink, Option<audio::AudioSource>) = {
        tracing::warn!("built without the `audio` feature: receive only, playback discarded");
        (audio::AudioSink::null(config.sample_rate), None)
    };

    let book = config.talkgroup_book();
    info!(modes = ?book.modes().collect::<Vec<_>>(), "📒 talkgroup lists loaded");
    let ctx = Arc::new(SessionContext::new(&config.mode(), config.slot, book, source.is_some()));

    let socket = Arc::new(commands::bind_reuseport(&config.rx_addr(), config.recv_buf_size)?);
    let sender = Arc::new(
        UsrpSender::new(socket.clone(), destinations, config.call.clone(), events.clone(), stats.clone())
    );

    let (lookup, lookup_task) = lookup::spawn_lookup_worker(Arc::new(NoLookup), events.clone(), shutdown.clone());

    let mut handles = vec![lookup_task];

    // Spawn stats reporter
    let stats_clone = stats.clone();
    let stats_interval = config.stats_interval_secs;
    let token = shutdown.clone();
    handles.push(
        tokio::spawn(async move {
            stats::stats_reporter(stats_clone, stats_interval, token).await;
        })
    );

    handles.push(tokio::spawn(commands::ping_loop(sender.clone(), config.ping_interval_secs, shutdown.clone())));

    // Receive path
    let receiver = RxEngine::new(
        ctx.clone(),
        sender.clone(),
        events.clone(),
        lookup.clone(),
        sink,
        stats.clone(),
        shutdown.clone(),
        RxOptions {
            private_call_min_id: config.private_call_min_id,
            download_dir: config.download_dir.clone(),
            ..RxOptions::default()
        }
    );
    handles.push(tokio::spawn(rx_engine::rx_loop(receiver, socket, shutdown.clone())));

    // Transmit path
    if let Some(source) = source {
        let vox = config.vox.then(|| Vox::new(config.vox_threshold, config.vox_delay));
        if let Some(v) = &vox {
            info!(threshold = v.threshold(), delay = v.delay(), "VOX enabled");
        }
        let transmitter = TxEngine::new(
            ctx.clone(),
            sender.clone(),
            events.clone(),
            lookup.clone(),
            config.call.clone(),
            vox,
            source.sample_rate()
        );
        handles.push(tokio::spawn(tx_engine::tx_loop(transmitter, source, shutdown.clone())));
    } else {
        info!("no input device: transmit disabled");
    }

    // Front end
    let (commands_tx, commands_rx) = mpsc::channel::<UiCommand>(64);
    tokio::spawn(console::event_printer(events_rx));
    tokio::spawn(console::stdin_loop(ctx.clone(), commands_tx.clone(), shutdown.clone()));

    let signal_tx = commands_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send(UiCommand::Shutdown).await;
        }
    });

    let station = Station {
        call: config.call.clone(),
        subscriber_id: config.subscriber_id,
        repeater_id: config.repeater_id,
    };
    let controller = Controller::new(ctx, sender, events, lookup, station, config.asl_mode);
    let controller_task = tokio::spawn(controller::controller_loop(controller, commands_rx, shutdown.clone()));

    info!("✅ All systems go, type 'help' for commands");

    controller_task.await?;
    shutdown.cancel();
    for h in handles {
        h.await?;
    }

    info!("👋 bye");
    Ok(())
}
