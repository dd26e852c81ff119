//! Client/server loopback tests: a pusher client against the in-process echo
//! server, with the session registry checked after the run.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use quic_pusher::{bind_socket, client, server, server_config, server_crypto, stats::SessionRegistry};

/// Starts an echo server on an ephemeral loopback port, returning its port.
fn spawn_echo_server(crypto: rustls::ServerConfig) -> Result<u16> {
    let config = server_config(crypto)?;
    let socket = bind_socket("127.0.0.1:0".parse()?, 1 << 21, 1 << 21)?;
    let endpoint = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        Some(config),
        socket,
        Arc::new(quinn::TokioRuntime),
    )?;
    let port = endpoint.local_addr()?.port();
    tokio::spawn(server::serve(endpoint));
    Ok(port)
}

#[tokio::test]
async fn fixed_payload_roundtrip() -> Result<()> {
    let port = spawn_echo_server(server_crypto(None, None, false)?)?;

    let opt = client::Opt::try_parse_from([
        "client",
        &format!("localhost:{port}"),
        "--ip",
        "127.0.0.1",
        "--sessions",
        "2",
        "--count",
        "3",
        "--interval",
        "10",
        "--metrics-port",
        "0",
    ])?;

    let registry = Arc::new(SessionRegistry::default());
    client::run_with_registry(opt, registry.clone()).await?;

    let snapshot = registry.snapshot();
    let payload_len = "hello quic from client".len() as u64;
    assert_eq!(snapshot.sessions.len(), 2);
    assert_eq!(snapshot.total_sends(), 6);
    assert_eq!(snapshot.total_bytes(), 2 * 3 * payload_len);
    assert_eq!(snapshot.total_echo_mismatches(), 0);
    assert_eq!(snapshot.active_sessions(), 0);
    assert_eq!(snapshot.latency.count, 6);
    Ok(())
}

#[tokio::test]
async fn count_zero_sends_nothing() -> Result<()> {
    let port = spawn_echo_server(server_crypto(None, None, false)?)?;

    let opt = client::Opt::try_parse_from([
        "client",
        &format!("localhost:{port}"),
        "--ip",
        "127.0.0.1",
        "--count",
        "0",
        "--metrics-port",
        "0",
    ])?;

    let registry = Arc::new(SessionRegistry::default());
    client::run_with_registry(opt, registry.clone()).await?;

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.total_sends(), 0);
    assert_eq!(snapshot.total_bytes(), 0);
    assert_eq!(snapshot.active_sessions(), 0);
    Ok(())
}

#[tokio::test]
async fn duration_cap_stops_looping_client() -> Result<()> {
    let port = spawn_echo_server(server_crypto(None, None, false)?)?;

    let opt = client::Opt::try_parse_from([
        "client",
        &format!("localhost:{port}"),
        "--ip",
        "127.0.0.1",
        "--loop",
        "--interval",
        "10",
        "--duration",
        "1",
        "--metrics-port",
        "0",
    ])?;

    let registry = Arc::new(SessionRegistry::default());
    client::run_with_registry(opt, registry.clone()).await?;

    let snapshot = registry.snapshot();
    // Looping would never stop on its own; the duration cap must end the
    // session cleanly after plenty of sends.
    assert!(snapshot.total_sends() > 10);
    assert_eq!(snapshot.total_echo_mismatches(), 0);
    assert_eq!(snapshot.active_sessions(), 0);
    Ok(())
}

#[tokio::test]
async fn random_payload_roundtrip() -> Result<()> {
    let port = spawn_echo_server(server_crypto(None, None, false)?)?;

    let opt = client::Opt::try_parse_from([
        "client",
        &format!("localhost:{port}"),
        "--ip",
        "127.0.0.1",
        "--count",
        "4",
        "--interval",
        "10",
        "--random",
        "--random-len",
        "100",
        "--metrics-port",
        "0",
    ])?;

    let registry = Arc::new(SessionRegistry::default());
    client::run_with_registry(opt, registry.clone()).await?;

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.total_sends(), 4);
    assert_eq!(snapshot.total_bytes(), 400);
    assert_eq!(snapshot.total_echo_mismatches(), 0);
    Ok(())
}

#[tokio::test]
async fn verified_roundtrip_with_ca() -> Result<()> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])?;

    let dir = std::env::temp_dir().join(format!("quic-pusher-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let cert_path = dir.join("server.crt");
    let key_path = dir.join("server.key");
    std::fs::write(&cert_path, cert.cert.pem())?;
    std::fs::write(&key_path, cert.signing_key.serialize_pem())?;

    let crypto = server_crypto(Some(&cert_path), Some(&key_path), false)?;
    let port = spawn_echo_server(crypto)?;

    let opt = client::Opt::try_parse_from([
        "client",
        &format!("localhost:{port}"),
        "--ip",
        "127.0.0.1",
        "--count",
        "2",
        "--interval",
        "10",
        "--auth",
        "--ca",
        cert_path.to_str().unwrap(),
        "--metrics-port",
        "0",
    ])?;

    let registry = Arc::new(SessionRegistry::default());
    client::run_with_registry(opt, registry.clone()).await?;

    assert_eq!(registry.snapshot().total_sends(), 2);
    Ok(())
}
