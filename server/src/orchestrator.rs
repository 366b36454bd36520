//! Hosting-session orchestration: listeners, per-connection I/O tasks,
//! the console reader and the single drain loop that owns all shared
//! state mutation.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use shared::codec::{decode_datagram, encode_frame};
use shared::ServerMessageKind;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch, RwLock};

use crate::connection::{run_reader, run_writer, InboundMessage};
use crate::dispatcher::{ConsoleCommand, Dispatcher};
use crate::error::{Result, ServerError};
use crate::registry::SessionRegistry;
use crate::settings::ServerSettings;
use crate::store::UniverseStore;

/// Cadence of the reconciliation pass.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// How long queued goodbye frames get to reach their sockets on stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const DATAGRAM_BUFFER_LEN: usize = 64 * 1024;

/// Runs one hosting session until `shutdown` fires, the console asks to
/// stop, or a worker reports a fatal error. Everything the session
/// allocates (listeners, sessions, universe) dies with it.
pub async fn run_server(
    settings: Arc<StdMutex<ServerSettings>>,
    store: Box<dyn UniverseStore>,
    host: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (tcp_port, udp_port, max_players, autosave) = {
        let settings = settings.lock().unwrap();
        (
            settings.tcp_port(),
            settings.udp_port(),
            settings.max_players(),
            settings.autosave_interval(),
        )
    };

    // A listener that cannot bind is an environment failure; the outer
    // supervision loop retries it after its delay. Transport stays
    // reserved for per-connection I/O.
    let listener = TcpListener::bind((host, tcp_port))
        .await
        .map_err(|e| ServerError::Fatal(format!("cannot bind tcp {}:{}: {}", host, tcp_port, e)))?;
    let datagram_socket = Arc::new(
        UdpSocket::bind((host, udp_port))
            .await
            .map_err(|e| {
                ServerError::Fatal(format!("cannot bind udp {}:{}: {}", host, udp_port, e))
            })?,
    );
    info!(
        "listening on {}:{} (tcp) and {}:{} (udp), capacity {}",
        host, tcp_port, host, udp_port, max_players
    );

    let registry = Arc::new(RwLock::new(SessionRegistry::new(max_players)));
    let mut dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&settings), store);

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
    let (console_tx, mut console_rx) = mpsc::unbounded_channel::<ConsoleCommand>();
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<ServerError>();
    // Workers watch this; it fires once at teardown.
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(accept_loop(
        listener,
        Arc::clone(&registry),
        inbound_tx.clone(),
        fatal_tx.clone(),
        stop_rx.clone(),
    ));
    tokio::spawn(datagram_loop(
        Arc::clone(&datagram_socket),
        inbound_tx.clone(),
        stop_rx.clone(),
    ));
    tokio::spawn(console_loop(console_tx, stop_rx.clone()));

    let mut reconcile = tokio::time::interval(RECONCILE_INTERVAL);
    reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut save = tokio::time::interval(autosave);
    save.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    save.reset();

    let outcome = loop {
        tokio::select! {
            Some(message) = inbound_rx.recv() => {
                dispatcher.dispatch(message).await;
            }
            Some(command) = console_rx.recv() => {
                if dispatcher.handle_console(command).await {
                    info!("stop requested from console");
                    break Ok(());
                }
            }
            Some(fatal) = fatal_rx.recv() => {
                error!("fatal worker error: {}", fatal);
                break Err(fatal);
            }
            _ = reconcile.tick() => {
                dispatcher.reconcile(Instant::now()).await;
            }
            _ = save.tick() => {
                dispatcher.save_all();
                debug!("autosave complete");
            }
            _ = shutdown.changed() => {
                info!("shutdown signal received");
                break Ok(());
            }
        }
    };

    dispatcher.save_all();
    {
        let guard = registry.read().await;
        guard.broadcast(
            ServerMessageKind::ConnectionEnd,
            b"server shutting down",
            None,
        );
    }
    let _ = stop_tx.send(true);
    // Writers flush their queues on the stop signal; give them a bounded
    // window before the listeners and sockets are dropped.
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    info!("hosting session ended");
    outcome
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<RwLock<SessionRegistry>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    fatal: mpsc::UnboundedSender<ServerError>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = fatal.send(ServerError::Fatal(format!(
                            "tcp accept failed: {}",
                            e
                        )));
                        return;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay for {} failed: {}", addr, e);
                }
                let (read_half, mut write_half) = stream.into_split();
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let session = {
                    let mut guard = registry.write().await;
                    guard.try_accept(addr, outbound_tx)
                };
                let Some(session) = session else {
                    info!("refusing {}: server is full", addr);
                    let goodbye =
                        encode_frame(ServerMessageKind::ConnectionEnd as i32, b"server is full");
                    let _ = write_half.write_all(&goodbye).await;
                    let _ = write_half.shutdown().await;
                    continue;
                };
                tokio::spawn(run_reader(
                    read_half,
                    Arc::clone(&session),
                    inbound.clone(),
                    stop.clone(),
                ));
                tokio::spawn(run_writer(outbound_rx, write_half, session, stop.clone()));
            }
            _ = stop.changed() => return,
        }
    }
}

/// Datagrams carry the same framed messages prefixed with the sender's
/// session index. Anything that does not parse is dropped silently;
/// datagrams are advisory by contract.
async fn datagram_loop(
    socket: Arc<UdpSocket>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER_LEN];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("datagram receive failed: {}", e);
                        continue;
                    }
                };
                match decode_datagram(&buf[..len]) {
                    Ok((index, kind, payload)) => {
                        let _ = inbound.send(InboundMessage {
                            index,
                            kind,
                            payload,
                            via_datagram: true,
                        });
                    }
                    Err(e) => debug!("bad datagram from {}: {}", from, e),
                }
            }
            _ = stop.changed() => return,
        }
    }
}

async fn console_loop(commands: mpsc::UnboundedSender<ConsoleCommand>, mut stop: watch::Receiver<bool>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_console_line(line) {
                    Some(command) => {
                        if commands.send(command).is_err() {
                            return;
                        }
                    }
                    None => info!(
                        "unknown command; try: kick, ban, say, register, save, set, status, stop"
                    ),
                }
            }
            _ = stop.changed() => return,
        }
    }
}

/// Parses one console line. The first word selects the command; `say`
/// and `kick` reasons take the rest of the line verbatim.
pub fn parse_console_line(line: &str) -> Option<ConsoleCommand> {
    let mut words = line.splitn(2, char::is_whitespace);
    let verb = words.next()?;
    let rest = words.next().unwrap_or("").trim();
    match verb {
        "kick" => {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let name = parts.next().filter(|n| !n.is_empty())?.to_string();
            let reason = parts
                .next()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "kicked by admin".to_string());
            Some(ConsoleCommand::Kick { name, reason })
        }
        "ban" => {
            if rest.is_empty() {
                None
            } else {
                Some(ConsoleCommand::Ban {
                    name: rest.to_string(),
                })
            }
        }
        "say" => {
            if rest.is_empty() {
                None
            } else {
                Some(ConsoleCommand::Broadcast {
                    text: rest.to_string(),
                })
            }
        }
        "register" => {
            if rest.is_empty() {
                None
            } else {
                Some(ConsoleCommand::Register {
                    name: rest.to_string(),
                })
            }
        }
        "save" => Some(ConsoleCommand::Save),
        "set" => {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let key = parts.next().filter(|k| !k.is_empty())?.to_string();
            let value = parts.next()?.trim().to_string();
            Some(ConsoleCommand::Set { key, value })
        }
        "status" => Some(ConsoleCommand::Status),
        "stop" | "quit" | "exit" => Some(ConsoleCommand::Stop),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn bind_conflict_ends_the_session_fatally() {
        let occupier = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupier.local_addr().unwrap().port();

        let mut settings = ServerSettings::default();
        settings.set("tcp_port", &port.to_string()).unwrap();
        let settings = Arc::new(StdMutex::new(settings));

        let (_stop_tx, stop_rx) = watch::channel(false);
        let result = run_server(
            settings,
            Box::new(MemoryStore::new()),
            "127.0.0.1",
            stop_rx,
        )
        .await;
        assert!(
            matches!(result, Err(ServerError::Fatal(_))),
            "a bind conflict must take the supervised restart path, got {:?}",
            result.err()
        );
    }

    #[test]
    fn parses_kick_with_and_without_reason() {
        assert_eq!(
            parse_console_line("kick jeb too rowdy"),
            Some(ConsoleCommand::Kick {
                name: "jeb".into(),
                reason: "too rowdy".into()
            })
        );
        assert_eq!(
            parse_console_line("kick jeb"),
            Some(ConsoleCommand::Kick {
                name: "jeb".into(),
                reason: "kicked by admin".into()
            })
        );
        assert_eq!(parse_console_line("kick"), None);
    }

    #[test]
    fn parses_say_and_set() {
        assert_eq!(
            parse_console_line("say restart in 5 minutes"),
            Some(ConsoleCommand::Broadcast {
                text: "restart in 5 minutes".into()
            })
        );
        assert_eq!(
            parse_console_line("set motd Hello there"),
            Some(ConsoleCommand::Set {
                key: "motd".into(),
                value: "Hello there".into()
            })
        );
        assert_eq!(parse_console_line("set motd"), None);
    }

    #[test]
    fn parses_simple_verbs_and_rejects_unknown() {
        assert_eq!(parse_console_line("save"), Some(ConsoleCommand::Save));
        assert_eq!(parse_console_line("status"), Some(ConsoleCommand::Status));
        assert_eq!(parse_console_line("stop"), Some(ConsoleCommand::Stop));
        assert_eq!(parse_console_line("quit"), Some(ConsoleCommand::Stop));
        assert_eq!(
            parse_console_line("ban bob"),
            Some(ConsoleCommand::Ban { name: "bob".into() })
        );
        assert_eq!(parse_console_line("frobnicate"), None);
    }
}
