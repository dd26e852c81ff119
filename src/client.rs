//! The load-generating client: one task per session, one stream per session,
//! payloads written on a schedule.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use quinn::TokioRuntime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bind_socket, client_config, client_crypto, local_addr_for, lookup_host, parse_byte_size,
    metrics::{MetricsServer, PrometheusExporter},
    payload::{Pacing, PayloadMode, PayloadSource},
    stats::SessionRegistry,
};

/// Opens QUIC sessions against an echo server and writes payloads on a schedule
#[derive(Parser)]
#[clap(name = "client")]
pub struct Opt {
    /// Host to connect to
    #[clap(default_value = "localhost:6666")]
    host: String,
    /// Override DNS resolution for host
    #[clap(long)]
    ip: Option<IpAddr>,
    /// Specify the local socket address
    ///
    /// Sessions bind an ephemeral port each by default; a pinned address only
    /// makes sense with a single session.
    #[clap(long)]
    local_addr: Option<SocketAddr>,
    /// Number of concurrently initiated sessions
    #[clap(long, default_value = "1")]
    sessions: u32,
    /// Number of sends per session
    #[clap(long, short = 'c', default_value = "1")]
    count: u64,
    /// Milliseconds to sleep between sends
    #[clap(long, default_value = "1000")]
    interval: u64,
    /// Target bitrate in bits per second; overrides the fixed interval
    ///
    /// This can use SI suffixes, e.g. 1M paces sends to one mebibit per second.
    #[clap(long, value_parser = parse_byte_size)]
    bitrate: Option<u64>,
    /// Message to send
    #[clap(long, short = 'm', default_value = "hello quic from client")]
    message: String,
    /// Send a fresh random string each time instead of the fixed message
    #[clap(long, short = 'r')]
    random: bool,
    /// Length of the random string
    #[clap(long, default_value = "10")]
    random_len: usize,
    /// Keep sending forever, ignoring the send count
    #[clap(long = "loop")]
    looping: bool,
    /// Log the content of every payload
    #[clap(long, short = 'd')]
    dump: bool,
    /// Read back the server's echo and verify it matches what was sent
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    echo: bool,
    /// Verify the server certificate against the CA bundle
    #[clap(long)]
    auth: bool,
    /// CA certificate bundle in PEM format
    #[clap(long, default_value = "ca.crt")]
    ca: PathBuf,
    /// Client certificate chain in PEM format, for mutual auth
    #[clap(long, requires = "key")]
    cert: Option<PathBuf>,
    /// Client private key in PEM format, for mutual auth
    #[clap(long, requires = "cert")]
    key: Option<PathBuf>,
    /// Stop after this many seconds even if sends remain
    #[clap(long)]
    duration: Option<u64>,
    /// Port for the Prometheus metrics endpoint
    #[clap(long, default_value = "8811")]
    metrics_port: u16,
    /// Seconds between console stats summaries
    #[clap(long, default_value = "10")]
    stats_interval: u64,
    /// Send buffer size in bytes
    #[clap(long, default_value = "2M", value_parser = parse_byte_size)]
    send_buffer_size: u64,
    /// Receive buffer size in bytes
    #[clap(long, default_value = "2M", value_parser = parse_byte_size)]
    recv_buffer_size: u64,
    /// Write TLS keys to the file named by SSLKEYLOGFILE
    #[clap(long)]
    keylog: bool,
}

pub async fn run(opt: Opt) -> Result<()> {
    run_with_registry(opt, Arc::new(SessionRegistry::default())).await
}

/// Like [`run`], but over a caller-supplied registry so the counters remain
/// inspectable after the run completes.
pub async fn run_with_registry(opt: Opt, registry: Arc<SessionRegistry>) -> Result<()> {
    let exporter = Arc::new(
        PrometheusExporter::new(registry.clone()).context("creating Prometheus exporter")?,
    );
    let mut metrics_server = MetricsServer::start(
        SocketAddr::from(([0, 0, 0, 0], opt.metrics_port)),
        exporter,
    )
    .await?;

    let (host_name, remote) = lookup_host(&opt.host, opt.ip).await?;
    info!("pushing to {host_name} at {remote}");

    let crypto = client_crypto(
        opt.auth,
        &opt.ca,
        opt.cert.as_deref().zip(opt.key.as_deref()),
        opt.keylog,
    )?;
    let config = client_config(crypto)?;

    let session_cfg = Arc::new(SessionConfig {
        remote,
        host_name: host_name.to_owned(),
        config,
        local_addr: opt.local_addr,
        send_buffer_size: opt.send_buffer_size as usize,
        recv_buffer_size: opt.recv_buffer_size as usize,
        count: opt.count,
        looping: opt.looping,
        echo: opt.echo,
        dump: opt.dump,
        payload: match opt.random {
            true => PayloadMode::Random {
                len: opt.random_len,
            },
            false => PayloadMode::Fixed(opt.message.clone()),
        },
        pacing: Pacing::new(Duration::from_millis(opt.interval), opt.bitrate),
    });

    // Cancels the session write loops
    let shutdown = CancellationToken::new();

    // Cancels the stats task once all sessions are done
    let shutdown_stats = CancellationToken::new();

    let mut sessions = JoinSet::new();
    for id in 0..opt.sessions {
        let cfg = session_cfg.clone();
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        sessions.spawn(async move { session(id, cfg, registry, shutdown).await });
    }

    let stats_registry = registry.clone();
    let stats_token = shutdown_stats.clone();
    let stats_interval = Duration::from_secs(opt.stats_interval.max(1));
    let stats_fut = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = stats_token.cancelled() => {
                    stats_registry.snapshot().print();
                    break;
                }
                _ = tokio::time::sleep(stats_interval) => {
                    stats_registry.snapshot().print();
                }
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let deadline = tokio::time::sleep(Duration::from_secs(opt.duration.unwrap_or(0)));
    tokio::pin!(deadline);

    let mut failed = false;
    let mut ctrlc_fired = false;
    let mut deadline_disarmed = opt.duration.is_none();
    loop {
        tokio::select! {
            res = sessions.join_next() => match res {
                Some(Ok(Ok(()))) => debug!("session task finished"),
                Some(Ok(Err(e))) => {
                    error!("session failed: {e:#}");
                    failed = true;
                }
                Some(Err(e)) => {
                    error!("session task panicked: {e}");
                    failed = true;
                }
                None => break,
            },
            _ = &mut ctrl_c, if !ctrlc_fired => {
                info!("shutting down (ctrl-c)");
                ctrlc_fired = true;
                shutdown.cancel();
            }
            _ = &mut deadline, if !deadline_disarmed => {
                info!("shutting down (duration elapsed)");
                deadline_disarmed = true;
                shutdown.cancel();
            }
        }
    }

    shutdown_stats.cancel();
    let _ = stats_fut.await;
    metrics_server.stop();

    if failed {
        bail!("one or more sessions failed");
    }
    info!("all sessions finished");
    Ok(())
}

struct SessionConfig {
    remote: SocketAddr,
    host_name: String,
    config: quinn::ClientConfig,
    local_addr: Option<SocketAddr>,
    send_buffer_size: usize,
    recv_buffer_size: usize,
    count: u64,
    looping: bool,
    echo: bool,
    dump: bool,
    payload: PayloadMode,
    pacing: Pacing,
}

/// Dials the server, opens one bidirectional stream, and runs the write loop
/// until the send count is reached or the session is cancelled.
async fn session(
    id: u32,
    cfg: Arc<SessionConfig>,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) -> Result<()> {
    let bind_addr = local_addr_for(cfg.remote, cfg.local_addr);
    let socket = bind_socket(bind_addr, cfg.send_buffer_size, cfg.recv_buffer_size)?;
    let endpoint = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        None,
        socket,
        Arc::new(TokioRuntime),
    )
    .context("creating endpoint")?;

    debug!("session {id}: dialing {}", cfg.remote);
    let connection = endpoint
        .connect_with(cfg.config.clone(), cfg.remote, &cfg.host_name)?
        .await
        .context("connecting")?;
    let local = endpoint.local_addr().context("local addr")?;
    info!("session {id}: established from {local}");

    let (mut send, mut recv) = connection.open_bi().await.context("opening stream")?;
    debug!("session {id}: opened stream {}", send.id());

    let counters = registry.register(local.to_string());
    let mut source = PayloadSource::new(cfg.payload.clone());
    let mut echo_buf = Vec::new();

    let mut sent = 0u64;
    let result: Result<()> = loop {
        if shutdown.is_cancelled() {
            break Ok(());
        }
        if !cfg.looping && sent >= cfg.count {
            break Ok(());
        }

        let payload = source.next_payload();
        if cfg.dump {
            info!("session {id}: snd '{payload}', count {sent}");
        } else {
            info!("session {id}: snd count {sent}");
        }

        let start = Instant::now();
        let write = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            res = send.write_all(payload.as_bytes()) => res,
        };
        if let Err(e) = write.context("writing payload") {
            break Err(e);
        }
        let latency = start.elapsed();

        counters.on_send(payload.len());
        registry.record_latency(latency);
        debug!("session {id}: wrote {} bytes in {latency:?}", payload.len());

        if cfg.echo {
            echo_buf.resize(payload.len(), 0);
            let read = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                res = recv.read_exact(&mut echo_buf) => res,
            };
            if let Err(e) = read.context("reading echo") {
                break Err(e);
            }
            if echo_buf != payload.as_bytes() {
                counters.on_echo_mismatch();
                warn!("session {id}: echo mismatch on send {sent}");
            }
        }

        sent += 1;
        if !cfg.looping && sent >= cfg.count {
            continue;
        }

        let gap = cfg.pacing.gap(payload.len());
        if !gap.is_zero() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(gap) => {}
            }
        }
    };

    counters.finish();

    let _ = send.finish();
    if result.is_ok() && !shutdown.is_cancelled() {
        // Let the peer acknowledge outstanding data before closing
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {}
            _ = send.stopped() => {}
        }
    }
    connection.close(0u32.into(), b"done");
    endpoint.wait_idle().await;
    debug!("session {id}: closed");

    result
}
