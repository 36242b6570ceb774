//! Whole-engine scenarios over real loopback sockets, with scripted peers
//! built from the crate's own codec.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use bitcoin_network::{
    constants::{HEADING_SIZE, MAXIMUM_PROTOCOL},
    net::{Channel, Connector},
    protocol::{
        addr::AddressItem,
        codec::{serialize_message, Heading},
        message::{Identifier, Payload, Ping, Pong, Version, VersionAcknowledge},
        types::Magic,
    },
    protocols::VersionProtocol,
    runtime::Executor,
    Endpoint, Error, P2p, Settings,
};

const IDENTIFIER: u32 = 3_652_501_241;
const WAIT: Duration = Duration::from_secs(10);

fn base_settings() -> Settings {
    Settings {
        identifier: IDENTIFIER,
        validate_checksum: true,
        connect_timeout_seconds: 2,
        handshake_timeout_seconds: 5,
        retry_timeout_seconds: 1,
        ..Settings::default()
    }
}

fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs() as i64
}

fn unspecified_item() -> AddressItem {
    AddressItem {
        timestamp: 0,
        services: 1,
        ip: "0.0.0.0".parse().expect("ip"),
        port: 0,
    }
}

async fn read_frame(stream: &mut TcpStream) -> Option<(Heading, Vec<u8>)> {
    let mut heading_bytes = [0u8; HEADING_SIZE];
    stream.read_exact(&mut heading_bytes).await.ok()?;
    let heading = Heading::parse(&heading_bytes).ok()?;
    let mut payload = vec![0u8; heading.payload_size as usize];
    stream.read_exact(&mut payload).await.ok()?;
    Some((heading, payload))
}

async fn send_message<M: Payload>(stream: &mut TcpStream, message: &M) -> Option<()> {
    let frame = serialize_message(Magic::from_identifier(IDENTIFIER), MAXIMUM_PROTOCOL, message)
        .expect("frame");
    stream.write_all(&frame).await.ok()
}

/// Act as the remote side of a version handshake.
async fn serve_handshake(mut stream: TcpStream) -> Option<TcpStream> {
    let mut version_seen = false;
    let mut verack_seen = false;
    while !(version_seen && verack_seen) {
        let (heading, payload) = read_frame(&mut stream).await?;
        match heading.identifier() {
            Some(Identifier::Version) => {
                let theirs = Version::deserialize(MAXIMUM_PROTOCOL, &payload).ok()?;
                let mine = Version {
                    version: MAXIMUM_PROTOCOL,
                    services: 1,
                    timestamp: epoch_seconds(),
                    address_receive: theirs.address_sender,
                    address_sender: unspecified_item(),
                    nonce: 0x5eed_5eed_5eed_5eed,
                    user_agent: "/scripted-peer:0.1/".to_string(),
                    start_height: 0,
                    relay: false,
                };
                send_message(&mut stream, &mine).await?;
                send_message(&mut stream, &VersionAcknowledge).await?;
                version_seen = true;
            }
            Some(Identifier::VersionAcknowledge) => verack_seen = true,
            _ => {}
        }
    }
    Some(stream)
}

/// Scenario: disabled sub-sessions bypass to success and create nothing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_sessions_bypass_to_success() {
    let settings = Settings {
        host_pool_capacity: 0,
        seeds: vec![Endpoint::new("seed.example", 8333)],
        inbound_connections: 0,
        outbound_connections: 0,
        ..base_settings()
    };
    let p2p = P2p::with_executor(settings, Executor::current());

    timeout(WAIT, p2p.start())
        .await
        .expect("start should complete promptly")
        .expect("start should bypass seeding");
    timeout(WAIT, p2p.run())
        .await
        .expect("run should complete promptly")
        .expect("run should bypass inbound and outbound");

    assert_eq!(p2p.channel_count(), 0);
    assert_eq!(p2p.address_count(), 0);
}

/// Scenario: a manual endpoint that keeps disconnecting is retried without
/// bound.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_connection_retries_after_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");

    let (count_tx, mut count_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let _ = count_tx.send(());
            // Close immediately: the node's handshake fails with a
            // disconnect and the manual session must come back.
            drop(stream);
        }
    });

    let p2p = P2p::with_executor(base_settings(), Executor::current());
    timeout(WAIT, p2p.start())
        .await
        .expect("start should complete")
        .expect("start");
    p2p.connect(Endpoint::new(address.ip().to_string(), address.port()));

    for _ in 0..2 {
        timeout(WAIT, count_rx.recv())
            .await
            .expect("the endpoint should be redialed")
            .expect("accept counter");
    }
    p2p.close().expect("close");
}

/// Scenario: an outbound batch adopts exactly one channel and reserves
/// exactly one authority.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outbound_batch_adopts_a_single_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let live = listener.local_addr().expect("local addr");

    // The scripted peer completes the handshake and then idles, discarding
    // whatever the node sends.
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Some(mut stream) = serve_handshake(stream).await else {
            return;
        };
        while read_frame(&mut stream).await.is_some() {}
    });

    // Two candidates with no listener behind them.
    let dead_a = {
        let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        taken.local_addr().expect("local addr")
    };
    let dead_b = {
        let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        taken.local_addr().expect("local addr")
    };

    let settings = Settings {
        host_pool_capacity: 16,
        outbound_connections: 1,
        connect_batch_size: 3,
        ..base_settings()
    };
    let p2p = P2p::with_executor(settings, Executor::current());

    let candidates: Vec<AddressItem> = [live, dead_a, dead_b]
        .into_iter()
        .map(|address| AddressItem {
            timestamp: 1,
            services: 1,
            ip: address.ip(),
            port: address.port(),
        })
        .collect();
    assert_eq!(p2p.hosts().save(&candidates), 3);

    timeout(WAIT, p2p.start())
        .await
        .expect("start should complete")
        .expect("start");
    timeout(WAIT, p2p.run())
        .await
        .expect("run should complete")
        .expect("run");

    // Wait for the batch to adopt its winner.
    timeout(WAIT, async {
        loop {
            if p2p.channel_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("one outbound channel should be adopted");

    assert_eq!(p2p.channel_count(), 1);
    assert_eq!(p2p.reserved_count(), 1);
    p2p.close().expect("close");
}

/// Scenario: a peer that accepts TCP but never speaks trips the handshake
/// deadline, and the channel's subscribers see exactly one terminal code.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_peer_times_out_the_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    let silent = tokio::spawn(async move {
        // Hold the accepted socket open without speaking.
        let accepted = listener.accept().await;
        tokio::time::sleep(WAIT).await;
        drop(accepted);
    });

    let settings = Arc::new(Settings {
        handshake_timeout_seconds: 1,
        ..base_settings()
    });
    let parent = CancellationToken::new();
    let connector = Connector::new(settings.clone(), Executor::current(), &parent);
    let channel: Arc<Channel> = connector
        .connect(&address.ip().to_string(), address.port())
        .await
        .expect("connect");

    let (terminal_tx, mut terminal_rx) = mpsc::unbounded_channel();
    channel
        .subscribe_stop(move |event| {
            if let Err(code) = event {
                let _ = terminal_tx.send(code);
            }
            false
        })
        .expect("subscribe stop");

    let completion = VersionProtocol::start(&channel, &settings);
    channel.resume();

    let outcome = timeout(WAIT, completion)
        .await
        .expect("handshake should resolve")
        .expect("completion channel");
    assert_eq!(outcome, Err(Error::OperationTimeout));

    assert_eq!(
        timeout(WAIT, terminal_rx.recv()).await.expect("terminal"),
        Some(Error::OperationTimeout)
    );
    // Exactly one terminal notification.
    assert!(terminal_rx.try_recv().is_err());
    silent.abort();
}

/// Scenario: a pong with the wrong nonce is a protocol violation.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_pong_nonce_stops_the_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Some(mut stream) = serve_handshake(stream).await else {
            return;
        };
        while let Some((heading, payload)) = read_frame(&mut stream).await {
            if heading.identifier() == Some(Identifier::Ping) {
                let Ok(ping) = Ping::deserialize(MAXIMUM_PROTOCOL, &payload) else {
                    return;
                };
                let wrong = Pong {
                    nonce: ping.nonce.wrapping_add(1),
                };
                if send_message(&mut stream, &wrong).await.is_none() {
                    return;
                }
            }
        }
    });

    let p2p = P2p::with_executor(base_settings(), Executor::current());
    timeout(WAIT, p2p.start())
        .await
        .expect("start should complete")
        .expect("start");

    let (channel_tx, channel_rx) = oneshot::channel();
    let mut slot = Some(channel_tx);
    p2p.connect_with(
        Endpoint::new(address.ip().to_string(), address.port()),
        Box::new(move |event| {
            if let (Ok(channel), Some(tx)) = (event, slot.take()) {
                let _ = tx.send(channel);
            }
            false
        }),
    );

    let channel = timeout(WAIT, channel_rx)
        .await
        .expect("the manual connection should succeed")
        .expect("channel handle");

    let (terminal_tx, mut terminal_rx) = mpsc::unbounded_channel();
    let subscribed = channel.subscribe_stop(move |event| {
        if let Err(code) = event {
            let _ = terminal_tx.send(code);
        }
        false
    });

    let code = match subscribed {
        Ok(_) => timeout(WAIT, terminal_rx.recv())
            .await
            .expect("the channel should stop")
            .expect("terminal code"),
        // The violation can land before we subscribe.
        Err(_) => channel.stop_code().expect("stopped"),
    };
    assert_eq!(code, Error::ProtocolViolation);
    p2p.close().expect("close");
}
