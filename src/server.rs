//! The echo server the client is pointed at: every chunk received on a
//! stream is written straight back on the same stream.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use quinn::TokioRuntime;
use tracing::{debug, error, info};

use crate::{bind_socket, parse_byte_size, server_config, server_crypto};

/// Accepts sessions and echoes every stream payload back to the sender
#[derive(Parser)]
#[clap(name = "server")]
pub struct Opt {
    /// Address to listen on
    #[clap(long = "listen", default_value = "[::]:6666")]
    listen: SocketAddr,
    /// TLS certificate chain in PEM format
    #[clap(long, short = 'c', requires = "key")]
    cert: Option<PathBuf>,
    /// TLS private key in PEM format
    #[clap(long, short = 'k', requires = "cert")]
    key: Option<PathBuf>,
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
    let crypto = server_crypto(opt.cert.as_deref(), opt.key.as_deref(), opt.keylog)?;
    let config = server_config(crypto)?;

    let socket = bind_socket(
        opt.listen,
        opt.send_buffer_size as usize,
        opt.recv_buffer_size as usize,
    )?;
    let endpoint = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        Some(config),
        socket,
        Arc::new(TokioRuntime),
    )
    .context("creating endpoint")?;

    info!("listening on {}", endpoint.local_addr()?);

    serve(endpoint).await
}

/// Accept loop, factored out so tests can drive an endpoint they built
/// themselves.
pub async fn serve(endpoint: quinn::Endpoint) -> Result<()> {
    while let Some(handshake) = endpoint.accept().await {
        tokio::spawn(async move {
            if let Err(e) = handle(handshake).await {
                error!("connection lost: {e:#}");
            }
        });
    }
    Ok(())
}

async fn handle(handshake: quinn::Incoming) -> Result<()> {
    let connection = handshake.await.context("handshake failed")?;
    debug!("{} connected", connection.remote_address());

    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(stream) => stream,
            Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                debug!("{} closed", connection.remote_address());
                return Ok(());
            }
            Err(e) => return Err(e).context("accepting stream"),
        };
        tokio::spawn(async move {
            if let Err(e) = echo_stream(send, recv).await {
                error!("stream failed: {e:#}");
            }
        });
    }
}

async fn echo_stream(mut send: quinn::SendStream, mut recv: quinn::RecvStream) -> Result<()> {
    while let Some(chunk) = recv
        .read_chunk(64 * 1024, true)
        .await
        .context("reading stream")?
    {
        send.write_chunk(chunk.bytes).await.context("echoing")?;
    }

    let _ = send.finish();
    debug!("finished echoing {}", recv.id());
    Ok(())
}
