//! Line-oriented console front end: stdin lines become [`UiCommand`]s,
//! [`UiEvent`]s are written to the log.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, info, warn };

use crate::events::{ UiCommand, UiEvent };
use crate::session::SessionContext;

const HELP: &str = "\
commands: connect | disconnect | ptt | tg <tg>[,<tg>..] | mode <MODE> | slot <1|2>
          add <name>=<value> | dtmf <digits> | cmd <key=value> | settings | ambesize <bits>
          info | status | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleAction {
    Send(Vec<UiCommand>),
    Status,
    Help,
}

/// Parse one console line. `Err` carries a message for the user.
pub fn parse_console_line(line: &str) -> Result<ConsoleAction, String> {
    let line = line.trim();
    let (word, arg) = match line.split_once(char::is_whitespace) {
        Some((w, a)) => (w, a.trim()),
        None => (line, ""),
    };
    let need = |what: &str| need_arg(word, arg, what);

    let cmds = match word.to_ascii_lowercase().as_str() {
        "" | "help" | "?" => {
            return Ok(ConsoleAction::Help);
        }
        "status" => {
            return Ok(ConsoleAction::Status);
        }
        "connect" | "c" => vec![UiCommand::Connect],
        "disconnect" | "d" => vec![UiCommand::Disconnect],
        "ptt" | "p" => vec![UiCommand::TogglePtt],
        "info" => vec![UiCommand::RequestInfo],
        "settings" => vec![UiCommand::SendSettings],
        "ambesize" =>
            match need("a bit count")?.parse::<u32>() {
                Ok(bits) => vec![UiCommand::SetAmbeSize(bits)],
                Err(_) => {
                    return Err(format!("ambesize expects a number, got '{arg}'"));
                }
            }
        "quit" | "q" | "exit" => vec![UiCommand::Shutdown],
        "tg" => {
            let tgs: Vec<String> = need("a talkgroup")?
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            let select = match tgs.as_slice() {
                [one] => UiCommand::SelectTalkgroup(one.clone()),
                _ => UiCommand::SelectTalkgroups(tgs),
            };
            vec![select, UiCommand::Connect]
        }
        "mode" => vec![UiCommand::SelectMode(need("a mode")?.to_string())],
        "slot" =>
            match need("a slot")?.parse::<u8>() {
                Ok(s @ 1..=2) => vec![UiCommand::SetSlot(s)],
                _ => {
                    return Err(format!("slot must be 1 or 2, got '{arg}'"));
                }
            }
        "add" => {
            let (name, value) = need("name=value")?
                .split_once('=')
                .ok_or_else(|| "add expects name=value".to_string())?;
            vec![UiCommand::AddTalkgroup { name: name.trim().to_string(), value: value.trim().to_string() }]
        }
        "dtmf" => vec![UiCommand::Dtmf(need("digits")?.to_string())],
        "cmd" => vec![UiCommand::RemoteCommand(need("key=value")?.to_string())],
        other => {
            return Err(format!("unknown command '{other}'"));
        }
    };
    Ok(ConsoleAction::Send(cmds))
}

fn need_arg<'a>(word: &str, arg: &'a str, what: &str) -> Result<&'a str, String> {
    if arg.is_empty() { Err(format!("'{word}' needs {what}")) } else { Ok(arg) }
}

/// Blocking stdin reads live on a plain thread so a pending read never
/// holds up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(l) => {
                    if tx.blocking_send(l).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Read stdin until EOF or shutdown, forwarding commands to the controller.
pub async fn stdin_loop(ctx: Arc<SessionContext>, commands: mpsc::Sender<UiCommand>, shutdown: CancellationToken) {
    let mut lines = spawn_stdin_reader();
    info!("{HELP}");
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            l = lines.recv() => match l {
                Some(l) => l,
                None => {
                    debug!("stdin closed");
                    break;
                }
            },
        };
        match parse_console_line(&line) {
            Ok(ConsoleAction::Send(cmds)) => {
                for cmd in cmds {
                    if commands.send(cmd).await.is_err() {
                        return;
                    }
                }
            }
            Ok(ConsoleAction::Status) => {
                let s = ctx.snapshot();
                info!(
                    registered = s.registered,
                    tx_enabled = s.transmit_enabled,
                    tx_control = s.tx_control,
                    ptt = s.ptt,
                    mode = %s.mode,
                    slot = s.slot,
                    tg = s.current_talkgroup.as_deref().unwrap_or("-"),
                    talkgroups = s.talkgroups.len(),
                    last_seq = s.last_sequence_seen,
                    "📋 status"
                );
                for tg in &s.talkgroups {
                    let marker = if s.current_talkgroup.as_deref() == Some(tg.value.as_str()) { "*" } else { " " };
                    info!("{marker} {} = {}", tg.name, tg.value);
                }
                for m in ctx.macros() {
                    info!(value = %m.value, label = %m.label, "macro");
                }
            }
            Ok(ConsoleAction::Help) => info!("{HELP}"),
            Err(msg) => warn!("{msg}"),
        }
    }
}

/// Log every event the workers publish.
pub async fn event_printer(mut events: mpsc::Receiver<UiEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UiEvent::EndOfTransmission(e) =>
                info!(
                    date = %e.date(),
                    time = %e.time(),
                    call = %e.call,
                    slot = %e.slot,
                    tg = %e.talkgroup,
                    loss = %e.loss(),
                    duration = %e.duration(),
                    "📝 log"
                ),
            UiEvent::ConnectionStatus(s) => info!(status = %s, "🔗 status"),
            UiEvent::CurrentTransmission(Some(t)) => info!(tx = %t, "📻 on air"),
            UiEvent::Toast { title, text } => info!(title = %title, "💬 {text}"),
            UiEvent::MacroMenu(entries) => {
                for m in entries {
                    info!(value = %m.value, label = %m.label, "macro");
                }
            }
            UiEvent::Avatar { call, image_url: Some(url) } => debug!(call = %call, url = %url, "avatar"),
            UiEvent::AudioLevel(_) | UiEvent::CurrentTransmission(None) | UiEvent::Avatar { image_url: None, .. } => {}
            other => debug!(?other, "event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(line: &str) -> Vec<UiCommand> {
        match parse_console_line(line) {
            Ok(ConsoleAction::Send(cmds)) => cmds,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(send("connect"), vec![UiCommand::Connect]);
        assert_eq!(send("  P "), vec![UiCommand::TogglePtt]);
        assert_eq!(send("quit"), vec![UiCommand::Shutdown]);
        assert_eq!(parse_console_line("status"), Ok(ConsoleAction::Status));
        assert_eq!(parse_console_line(""), Ok(ConsoleAction::Help));
    }

    #[test]
    fn test_tg_single_and_scan() {
        assert_eq!(send("tg 3100"), vec![UiCommand::SelectTalkgroup("3100".into()), UiCommand::Connect]);
        assert_eq!(send("tg 91, 3100"), vec![
            UiCommand::SelectTalkgroups(vec!["91".into(), "3100".into()]),
            UiCommand::Connect,
        ]);
    }

    #[test]
    fn test_arguments() {
        assert_eq!(send("slot 1"), vec![UiCommand::SetSlot(1)]);
        assert!(parse_console_line("slot 3").is_err());
        assert!(parse_console_line("mode").is_err());
        assert_eq!(send("add TAC 310 = 310"), vec![UiCommand::AddTalkgroup {
            name: "TAC 310".into(),
            value: "310".into(),
        }]);
        assert_eq!(send("cmd ambeMode=DMR"), vec![UiCommand::RemoteCommand("ambeMode=DMR".into())]);
        assert_eq!(send("ambesize 72"), vec![UiCommand::SetAmbeSize(72)]);
        assert!(parse_console_line("ambesize lots").is_err());
        assert!(parse_console_line("launch").is_err());
    }
}
