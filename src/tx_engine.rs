//! Transmit side: microphone chunks → VOX → voice packets.
//!
//! ```text
//!  AudioSource ──chunk──▶ resample to 8 kHz ──▶ RMS ──▶ Vox ──▶ PTT
//!                                   │
//!                                   └──▶ keyup edge? send(keyup = PTT)
//!                                        PTT on?     send(keyup = true)
//! ```

use std::sync::Arc;

use chrono::{ DateTime, Local };
use tokio_util::sync::CancellationToken;
use tracing::{ debug, info, warn };

use crate::audio::AudioSource;
use crate::commands::UsrpSender;
use crate::events::{ EventBus, LogEntry, UiEvent };
use crate::lookup::LookupHandle;
use crate::resampler::{ pcm_to_le_bytes, Resampler };
use crate::session::SessionContext;
use crate::usrp_protocol::{ NETWORK_SAMPLE_RATE, VOICE_FRAME_SAMPLES };
use crate::vox::{ compute_rms, Vox, VoxDecision };

/// Local PTT state change, shared by VOX and the manual control.
///
/// Turning PTT off closes the local transmission with a log row
/// (own call, 0% loss).
pub fn set_local_ptt(
    ctx: &SessionContext,
    events: &EventBus,
    lookup: &LookupHandle,
    my_call: &str,
    on: bool,
    now: DateTime<Local>
) {
    if ctx.ptt() == on {
        return;
    }
    ctx.set_ptt(on);
    events.emit(UiEvent::PttChanged { on });

    if on {
        let tg = ctx.current_talkgroup_name();
        info!(call = my_call, tg = %tg, "🎙️  PTT on");
        ctx.mark_local_tx_start(now);
        events.emit(UiEvent::CurrentTransmission(Some(format!("{my_call} -> {tg}"))));
        lookup.request(my_call);
        return;
    }

    info!(call = my_call, "PTT off");
    if let Some(started_at) = ctx.take_local_tx_start() {
        let entry = LogEntry {
            started_at,
            call: my_call.to_string(),
            slot: ctx.slot().to_string(),
            talkgroup: ctx.current_talkgroup_name(),
            loss_percent: 0.0,
            duration_secs: ((now - started_at).num_milliseconds() as f64) / 1000.0,
        };
        events.emit(UiEvent::EndOfTransmission(entry));
    }
    events.emit(UiEvent::CurrentTransmission(None));
}

pub struct TxEngine {
    ctx: Arc<SessionContext>,
    sender: Arc<UsrpSender>,
    events: EventBus,
    lookup: LookupHandle,
    call: String,
    vox: Option<Vox>,
    resampler: Resampler,
    last_ptt: bool,
}

impl TxEngine {
    pub fn new(
        ctx: Arc<SessionContext>,
        sender: Arc<UsrpSender>,
        events: EventBus,
        lookup: LookupHandle,
        call: impl Into<String>,
        vox: Option<Vox>,
        device_rate: u32
    ) -> Self {
        TxEngine {
            ctx,
            sender,
            events,
            lookup,
            call: call.into(),
            vox,
            resampler: Resampler::new(device_rate, NETWORK_SAMPLE_RATE),
            last_ptt: false,
        }
    }

    /// One 20 ms microphone chunk at the device rate.
    pub async fn process_chunk(&mut self, chunk: &[i16], now: DateTime<Local>) {
        let mut samples = self.resampler.process(chunk);
        // the gateway expects whole frames
        samples.resize(VOICE_FRAME_SAMPLES, 0);

        if let Some(vox) = self.vox.as_mut() {
            let rms = compute_rms(&samples);
            match vox.update(rms, self.ctx.ptt(), self.ctx.transmit_enabled()) {
                VoxDecision::KeyUp => {
                    debug!(rms, "VOX key up");
                    set_local_ptt(&self.ctx, &self.events, &self.lookup, &self.call, true, now);
                }
                VoxDecision::Unkey => {
                    debug!("VOX hangover expired");
                    set_local_ptt(&self.ctx, &self.events, &self.lookup, &self.call, false, now);
                }
                VoxDecision::Hold => {}
            }
        }

        let ptt = self.ctx.ptt();
        let pcm = pcm_to_le_bytes(&samples);
        if ptt != self.last_ptt {
            self.sender.send_voice(ptt, &pcm).await;
        }
        self.last_ptt = ptt;
        if ptt {
            self.sender.send_voice(true, &pcm).await;
        }
    }

    /// Send a closing unkey frame if the gateway still thinks we are keyed.
    pub async fn unkey(&mut self) {
        if self.last_ptt {
            self.sender.send_voice(false, &[0u8; VOICE_FRAME_SAMPLES * 2]).await;
            self.last_ptt = false;
        }
    }
}

/// Transmit loop: one chunk at a time until shutdown or the device closes.
pub async fn tx_loop(mut engine: TxEngine, mut source: AudioSource, shutdown: CancellationToken) {
    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => break,
            chunk = source.recv() => match chunk {
                Some(c) => c,
                None => {
                    warn!("input device closed; transmit stopped");
                    break;
                }
            },
        };
        engine.process_chunk(&chunk, Local::now()).await;
    }
    engine.unkey().await;
    debug!("TX loop stopped");
}
