mod args;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::Parser;
use futures::sink::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::{select, signal};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::args::Args;
use stalkd::config::{Config, Overrides};
use stalkd::engine::{Engine, EngineError, EngineHandle, EngineStats, JobStatsSnapshot, TubeStatsSnapshot};
use stalkd::types::session::ReserveDelivery;
use stalkd::types::{JobId, SessionId, TubeName};
use stalkd::wire::events::BeanstalkClientEvent;
use stalkd::wire::protocol::{Command, JobStats, Response, ServerStats, TubeStatsResp};
use stalkd::wire::{self, decoder};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let config = match Config::resolve(
        args.config_file.as_deref(),
        Overrides {
            listen: args.listen,
            port: args.port,
            max_job_size: args.max_job_size,
            wal_dir: args.wal_dir,
        },
    ) {
        Ok(c) => c,
        Err(error) => {
            error!(%error, "failed to resolve configuration");
            return ExitCode::from(2);
        },
    };

    let engine = if config.wal_enable {
        match Engine::recover(&config.wal_dir, config.wal_files) {
            Ok(engine) => engine,
            Err(error) => {
                error!(%error, dir = %config.wal_dir.display(), "failed to recover from WAL");
                return ExitCode::from(3);
            },
        }
    } else {
        Engine::new()
    };

    let handle = EngineHandle::new(engine);
    let sweep = handle.spawn_periodic_sweep(Duration::from_secs(1));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            info!("shutting down: draining");
            handle.with(|e| e.set_draining(true));
            cancel.cancel();
        });
    }

    let listener = match TcpListener::bind((config.listen, config.port)).await {
        Ok(l) => l,
        Err(error) => {
            error!(%error, "failed to listen for connections");
            sweep.abort();
            return ExitCode::from(111);
        },
    };

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code = match accept_loop(cancel, shutdown_hold, listener, handle, config.max_job_size).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    };

    shutdown_wait.recv().await;
    sweep.abort();

    exit_code
}

async fn accept_loop(
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
    listener: TcpListener,
    handle: EngineHandle,
    max_job_size: u32,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening");

    // Accept incoming connections until an exit signal is sent, and handle each
    // connection as its own task.
    loop {
        match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, _)) => {
                tokio::spawn(do_client_loop(
                    cancel.clone(),
                    shutdown_hold.clone(),
                    conn,
                    handle.clone(),
                    max_job_size,
                ));
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };
    }
}

/// A `put` whose header has been parsed but whose body is still arriving as
/// `PutChunk` events, per the decoder's own state machine.
struct PendingPut {
    pri: u32,
    delay: u32,
    ttr: u32,
    oversized: bool,
    body: Vec<u8>,
}

#[instrument(name = "client_loop", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn do_client_loop(
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    conn: TcpStream,
    handle: EngineHandle,
    max_job_size: u32,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let mut framed = wire::framed(conn);
    let session_id = match handle.with(|e| e.create_session()) {
        Some(id) => id,
        None => return Err(anyhow!("engine unavailable while creating session")),
    };

    let mut pending_put: Option<PendingPut> = None;

    let conn_result = loop {
        let evt = select! {
            x = framed.next() => match x {
                None => {
                    debug!("connection dropped");
                    break Ok(())
                },
                Some(r) => r,
            },
            _ = cancel.cancelled() => break Ok(()),
        };

        let evt = match evt {
            Ok(e) => e,
            Err(decoder::Error::IO(e)) => break Err(e.into()),
            Err(decoder::Error::Client(resp)) => {
                // Decoder says to send a particular response to the client
                select! {
                    x = framed.send(resp) => x?,
                    _ = cancel.cancelled() => break Ok(()),
                }

                break Err(anyhow!("client sent bad request and was disconnected"));
            },
        };

        match evt {
            BeanstalkClientEvent::Command(Command::Put { pri, delay, ttr, n_bytes }) => {
                let oversized = n_bytes > max_job_size;
                pending_put = Some(PendingPut {
                    pri,
                    delay,
                    ttr,
                    oversized,
                    body: if oversized { Vec::new() } else { Vec::with_capacity(n_bytes as usize) },
                });
                continue;
            },
            BeanstalkClientEvent::PutChunk(chunk) => {
                if let Some(put) = pending_put.as_mut() {
                    if !put.oversized {
                        put.body.extend_from_slice(&chunk);
                    }
                }
                continue;
            },
            BeanstalkClientEvent::PutEnd => {
                let Some(put) = pending_put.take() else {
                    if !send_or_break(&mut framed, &cancel, Response::BadFormat).await? {
                        break Ok(());
                    }
                    continue;
                };

                let resp = if put.oversized {
                    Response::JobTooBig
                } else {
                    match handle.with(|e| e.put(session_id, put.pri, put.delay, put.ttr, put.body)) {
                        Some(Ok(id)) => Response::Inserted { id: id.0 },
                        Some(Err(EngineError::Draining)) => Response::Draining,
                        Some(Err(_)) => Response::InternalError,
                        None => Response::InternalError,
                    }
                };

                if !send_or_break(&mut framed, &cancel, resp).await? {
                    break Ok(());
                }
                continue;
            },
            BeanstalkClientEvent::Discarded => continue,
            BeanstalkClientEvent::Command(cmd) => {
                if !dispatch_command(&mut framed, &cancel, &handle, session_id, cmd, max_job_size).await? {
                    break Ok(());
                }
                continue;
            },
        }
    };

    handle.with(|e| e.close_session(session_id));

    framed.into_inner().shutdown().await.context("during shutdown")?;

    conn_result
}

/// Handles every command except `put` (accumulated separately above).
/// Returns `Ok(false)` when the connection should close (an explicit
/// `quit`, or cancellation arriving mid-response).
async fn dispatch_command(
    framed: &mut Framed<TcpStream, wire::Codec>,
    cancel: &CancellationToken,
    handle: &EngineHandle,
    session_id: SessionId,
    cmd: Command,
    max_job_size: u32,
) -> Result<bool> {
    match cmd {
        Command::Put { .. } => unreachable!("put is handled at the event level"),

        Command::Quit => Ok(false),

        Command::Reserve => {
            let delivery = handle.reserve(session_id, None).await;
            respond_reserve(framed, cancel, handle, delivery).await
        },
        Command::ReserveWithTimeout { timeout } => {
            let delivery = handle.reserve(session_id, Some(Duration::from_secs(timeout as u64))).await;
            respond_reserve(framed, cancel, handle, delivery).await
        },
        Command::ReserveJob { id } => {
            let outcome = handle.with(|e| e.reserve_job(session_id, JobId(id)));
            match outcome {
                Some(Ok(id)) => respond_job_body(framed, cancel, handle, id, true).await,
                Some(Err(_)) => send_or_break(framed, cancel, Response::NotFound).await,
                None => send_or_break(framed, cancel, Response::InternalError).await,
            }
        },

        Command::Peek { id } => {
            let found = handle.with(|e| e.peek_job(JobId(id))).flatten();
            respond_peek(framed, cancel, handle, found).await
        },
        Command::PeekReady => {
            let id = handle.with(|e| e.peek_ready(session_id)).flatten();
            respond_peek(framed, cancel, handle, id).await
        },
        Command::PeekDelayed => {
            let id = handle.with(|e| e.peek_delayed(session_id)).flatten();
            respond_peek(framed, cancel, handle, id).await
        },
        Command::PeekBuried => {
            let id = handle.with(|e| e.peek_buried(session_id)).flatten();
            respond_peek(framed, cancel, handle, id).await
        },

        Command::Use { tube } => {
            let name = tube_name_from(tube);
            let resp = match handle.with(|e| e.use_tube(session_id, name)) {
                Some(t) => Response::Using { tube: t.into_bytes() },
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },
        Command::Watch { tube } => {
            let name = tube_name_from(tube);
            let resp = match handle.with(|e| e.watch(session_id, name)) {
                Some(count) => Response::Watching { count },
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },
        Command::Ignore { tube } => {
            let name = tube_name_from(tube);
            let resp = match handle.with(|e| e.ignore(session_id, &name)) {
                Some(Ok(count)) => Response::Watching { count },
                Some(Err(_)) => Response::NotIgnored,
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },

        Command::Delete { id } => {
            let resp = match handle.with(|e| e.delete(session_id, JobId(id))) {
                Some(Ok(())) => Response::Deleted,
                Some(Err(_)) => Response::NotFound,
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },
        Command::Release { id, pri, delay } => {
            let resp = match handle.with(|e| e.release(session_id, JobId(id), pri, delay)) {
                Some(Ok(())) => Response::Released,
                Some(Err(_)) => Response::NotFound,
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },
        Command::Bury { id, pri } => {
            let resp = match handle.with(|e| e.bury(session_id, JobId(id), pri)) {
                Some(Ok(())) => Response::Buried,
                Some(Err(_)) => Response::NotFound,
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },
        Command::Touch { id } => {
            let resp = match handle.with(|e| e.touch(session_id, JobId(id))) {
                Some(Ok(())) => Response::Touched,
                Some(Err(_)) => Response::NotFound,
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },

        Command::Kick { bound } => {
            let count = handle.with(|e| e.kick(session_id, bound)).unwrap_or(0);
            send_or_break(framed, cancel, Response::KickedCount { count }).await
        },
        Command::KickJob { id } => {
            let resp = match handle.with(|e| e.kick_job(JobId(id))) {
                Some(Ok(())) => Response::Kicked,
                Some(Err(_)) => Response::NotFound,
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },

        Command::PauseTube { tube, delay } => {
            let name = tube_name_from(tube);
            let resp = match handle.with(|e| e.pause_tube(&name, delay)) {
                Some(Ok(())) => Response::Paused,
                Some(Err(_)) => Response::NotFound,
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },

        Command::ListTubes => {
            let tubes = handle.with(|e| e.list_tubes()).unwrap_or_default();
            let resp = Response::OkListTubes {
                tubes: tubes.into_iter().map(TubeName::into_bytes).collect(),
            };
            send_or_break(framed, cancel, resp).await
        },
        Command::ListTubeUsed => {
            let resp = match handle.with(|e| e.list_tube_used(session_id)).flatten() {
                Some(tube) => Response::Using { tube: tube.into_bytes() },
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },
        Command::ListTubesWatched => {
            let tubes = handle.with(|e| e.list_tubes_watched(session_id)).unwrap_or_default();
            let resp = Response::OkListTubes {
                tubes: tubes.into_iter().map(TubeName::into_bytes).collect(),
            };
            send_or_break(framed, cancel, resp).await
        },

        Command::StatsJob { id } => {
            let resp = match handle.with(|e| e.stats_job(JobId(id))) {
                Some(Ok(snap)) => Response::OkStatsJob { data: job_stats_wire(snap) },
                Some(Err(_)) => Response::NotFound,
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },
        Command::StatsTube { tube } => {
            let name = tube_name_from(tube);
            let resp = match handle.with(|e| e.stats_tube(&name)) {
                Some(Ok(snap)) => Response::OkStatsTube { data: tube_stats_wire(snap) },
                Some(Err(_)) => Response::NotFound,
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },
        Command::StatsServer => {
            let resp = match handle.with(|e| e.stats()) {
                Some(snap) => Response::OkStats {
                    data: server_stats_wire(snap, max_job_size),
                },
                None => Response::InternalError,
            };
            send_or_break(framed, cancel, resp).await
        },
    }
}

async fn respond_reserve(
    framed: &mut Framed<TcpStream, wire::Codec>,
    cancel: &CancellationToken,
    handle: &EngineHandle,
    delivery: Option<ReserveDelivery>,
) -> Result<bool> {
    match delivery {
        Some(ReserveDelivery::Job(id)) => respond_job_body(framed, cancel, handle, id, true).await,
        Some(ReserveDelivery::TimedOut) => send_or_break(framed, cancel, Response::TimedOut).await,
        None => send_or_break(framed, cancel, Response::InternalError).await,
    }
}

async fn respond_peek(
    framed: &mut Framed<TcpStream, wire::Codec>,
    cancel: &CancellationToken,
    handle: &EngineHandle,
    id: Option<JobId>,
) -> Result<bool> {
    match id {
        Some(id) => respond_job_body(framed, cancel, handle, id, false).await,
        None => send_or_break(framed, cancel, Response::NotFound).await,
    }
}

/// Sends a job's body: a `RESERVED`/`FOUND` header followed by its data and
/// the trailing CRLF.
async fn respond_job_body(
    framed: &mut Framed<TcpStream, wire::Codec>,
    cancel: &CancellationToken,
    handle: &EngineHandle,
    id: JobId,
    reserved: bool,
) -> Result<bool> {
    let body = handle.with(|e| e.peek(id).map(|job| job.body.clone())).flatten();
    let Some(body) = body else {
        return send_or_break(framed, cancel, Response::NotFound).await;
    };

    let n_bytes = body.len() as u32;
    let header = if reserved {
        Response::Reserved { id: id.0, n_bytes }
    } else {
        Response::Found { id: id.0, n_bytes }
    };

    if !send_or_break(framed, cancel, header).await? {
        return Ok(false);
    }
    if !send_or_break(framed, cancel, Response::JobChunk(Bytes::from(body))).await? {
        return Ok(false);
    }
    send_or_break(framed, cancel, Response::JobEnd).await
}

/// Sends `resp`, racing against cancellation. Returns `Ok(false)` if
/// cancellation won the race and the caller should close the connection.
async fn send_or_break(
    framed: &mut Framed<TcpStream, wire::Codec>,
    cancel: &CancellationToken,
    resp: Response,
) -> Result<bool> {
    select! {
        x = framed.send(resp) => { x?; Ok(true) },
        _ = cancel.cancelled() => Ok(false),
    }
}

fn tube_name_from(bytes: Vec<u8>) -> TubeName {
    TubeName::new(String::from_utf8_lossy(&bytes).into_owned())
}

fn job_stats_wire(s: JobStatsSnapshot) -> JobStats {
    JobStats {
        id: s.id.0,
        tube: s.tube.into_bytes(),
        state: s.state,
        pri: s.priority,
        age: s.age_secs,
        delay: s.delay_secs,
        ttr: s.ttr_secs,
        time_left: s.time_left_secs,
        file: 0,
        reserves: s.reserves,
        timeouts: s.timeouts,
        releases: s.releases,
        buries: s.buries,
        kicks: s.kicks,
    }
}

fn tube_stats_wire(s: TubeStatsSnapshot) -> TubeStatsResp {
    TubeStatsResp {
        name: s.name.into_bytes(),
        ts: s.stats,
        pause_time_left: s.pause_time_left_secs,
    }
}

fn server_stats_wire(s: EngineStats, max_job_size: u32) -> ServerStats {
    ServerStats {
        current_jobs_urgent: s.current_jobs_urgent,
        current_jobs_ready: s.current_jobs_ready,
        current_jobs_reserved: s.current_jobs_reserved,
        current_jobs_delayed: s.current_jobs_delayed,
        current_jobs_buried: s.current_jobs_buried,
        cmd_put: s.cmd_put,
        cmd_peek: s.cmd_peek,
        cmd_peek_ready: s.cmd_peek_ready,
        cmd_peek_delayed: s.cmd_peek_delayed,
        cmd_peek_buried: s.cmd_peek_buried,
        cmd_reserve: s.cmd_reserve,
        cmd_reserve_with_timeout: s.cmd_reserve_with_timeout,
        cmd_touch: s.cmd_touch,
        cmd_use: s.cmd_use,
        cmd_watch: s.cmd_watch,
        cmd_ignore: s.cmd_ignore,
        cmd_delete: s.cmd_delete,
        cmd_release: s.cmd_release,
        cmd_bury: s.cmd_bury,
        cmd_kick: s.cmd_kick,
        cmd_stats: s.cmd_stats,
        cmd_stats_job: s.cmd_stats_job,
        cmd_stats_tube: s.cmd_stats_tube,
        cmd_list_tubes: s.cmd_list_tubes,
        cmd_list_tube_used: s.cmd_list_tube_used,
        cmd_list_tubes_watched: s.cmd_list_tubes_watched,
        cmd_pause_tube: s.cmd_pause_tube,
        job_timeouts: s.job_timeouts,
        total_jobs: s.total_jobs,
        max_job_size: max_job_size as u64,
        current_tubes: s.current_tubes,
        current_connections: s.current_connections,
        current_producers: s.current_producers,
        current_workers: s.current_workers,
        current_waiting: s.current_waiting,
        total_connections: s.total_connections,
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION"),
        // No portable, dependency-free way to read process CPU time without
        // a platform-specific crate; left at zero rather than pulling one in
        // for a single low-value stats field.
        rusage_utime: 0.0,
        rusage_stime: 0.0,
        uptime: s.uptime_secs,
        binlog_oldest_index: 0,
        binlog_current_index: 0,
        binlog_max_size: 0,
        binlog_records_written: 0,
        binlog_records_migrated: 0,
        draining: s.draining,
        id: process_instance_id(),
        hostname: Vec::new(),
        os: std::env::consts::OS.as_bytes().to_vec(),
        platform: std::env::consts::ARCH.as_bytes().to_vec(),
    }
}

/// A process-lifetime id, derived from the start time and pid — good enough
/// to distinguish two `stalkd` processes in `stats` output, which is its
/// only purpose.
fn process_instance_id() -> Vec<u8> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    format!("{:x}{:x}", std::process::id(), nanos).into_bytes()
}
