//! Pings a simulated vehicle over the loopback link.
//!
//! The vehicle answers every ping on the link-control port but drops the
//! first one, so the session has to resend it. Run with
//! `RUST_LOG=debug` to watch the retry bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use dronelink::prelude::*;
use dronelink::{ChecksumCodec, Codec};
use tokio::sync::Notify;
use tokio::time;
use tracing::{info, warn};

/// Finishes setup as soon as the vehicle has answered.
struct PingSetup;

impl ConnectionSetup for PingSetup {
    fn start(&self, uri: &str, handle: SetupHandle) {
        info!(uri, "setup started");
        tokio::spawn(async move {
            for _ in 0..50 {
                if handle.finish() {
                    return;
                }
                time::sleep(Duration::from_millis(20)).await;
            }
            warn!("vehicle never answered, setup abandoned");
        });
    }
}

/// Echoes link-control packets back, except the first.
async fn vehicle(peer: LoopbackPeer) {
    let codec = ChecksumCodec;
    peer.inject(codec.encode(&Packet::new(
        Header::from_byte(0x00),
        b"loopback vehicle ready".to_vec(),
    )));

    let mut dropped_first = false;
    while let Some(frame) = peer.recv_sent(Duration::from_secs(5)).await {
        let Ok(packet) = codec.decode(&frame) else {
            continue;
        };
        if packet.port() != Port::LINK_CONTROL {
            continue;
        }
        if !dropped_first {
            dropped_first = true;
            info!(%packet, "vehicle: dropping first ping");
            continue;
        }
        peer.inject(codec.encode(&packet));
    }
}

#[tokio::main]
async fn main() -> Result<(), DronelinkError> {
    dronelink::init_tracing();

    let resolver = LoopbackResolver::new();
    let peer = resolver.endpoint("ping");
    tokio::spawn(vehicle(peer.clone()));

    let mut config = LinkConfig::from_env();
    config.uri = peer.uri();
    config.idle_poll_interval = Duration::from_millis(20);

    let session = LinkSession::builder(resolver)
        .config(config)
        .setup(PingSetup)
        .build();

    let console = Arc::new(|packet: &Packet| {
        info!(text = %String::from_utf8_lossy(packet.payload()), "console");
        Ok::<(), HandlerError>(())
    });
    session.register_port_handler(Port::CONSOLE.value(), &console);

    let connected = Arc::new(Notify::new());
    let notify = Arc::clone(&connected);
    session.events().connected.subscribe(move |uri| {
        info!(uri, "connected");
        notify.notify_one();
    });

    session.open_default_link().await?;
    if time::timeout(Duration::from_secs(2), connected.notified())
        .await
        .is_err()
    {
        warn!("no answer from vehicle");
        session.close_link().await;
        return Ok(());
    }

    let header = Header::new(Port::LINK_CONTROL, Channel::new(0)?);
    for n in 0..3u8 {
        session
            .send_expecting(&Packet::new(header, vec![0x00, n]), &[0x00, n])
            .await?;
        time::sleep(Duration::from_millis(300)).await;
    }

    let metrics = session.retry_metrics();
    info!(
        armed = metrics.total_armed,
        resends = metrics.total_resends,
        matched = metrics.total_matched,
        "ping finished"
    );

    session.close_link().await;
    Ok(())
}
