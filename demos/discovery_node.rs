use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use juicenet::config::JuiceNetConfig;
use juicenet::dispatcher::ChannelHandler;
use juicenet::end_point::EndPoint;
use juicenet::identity::HmacTokenProvider;
use juicenet::packet::container::ReliabilityType;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::select;
use tracing::{error, info, warn, Level};

/// A node that answers discovery searches, optionally searches for peers itself, and echoes
///  every message it receives back to the sender
#[derive(Parser)]
struct Args {
    bind_address: String,

    /// the HMAC key shared by all nodes
    #[clap(long, default_value = "juicenet demo")]
    secret: String,

    /// search for peers at this address (e.g. a broadcast address) on startup
    #[clap(long)]
    search: Option<String>,

    /// send a greeting to all peers found by the search
    #[clap(long, default_value_t = false)]
    greet: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct EchoHandler {
    end_point: Weak<EndPoint>,
}

#[async_trait]
impl ChannelHandler for EchoHandler {
    async fn on_message(&self, sender: SocketAddr, channel_id: u8, payload: &[u8]) {
        info!("received {:?} from {:?} on channel {}", String::from_utf8_lossy(payload), sender, channel_id);

        let Some(end_point) = self.end_point.upgrade() else {
            return;
        };
        if payload.starts_with(b"echo: ") {
            return;
        }

        let mut reply = b"echo: ".to_vec();
        reply.extend_from_slice(payload);

        if let Err(e) = end_point.send(sender, &reply, ReliabilityType::Reliable, channel_id).await {
            warn!("could not echo to {:?}: {}", sender, e);
        }
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = JuiceNetConfig::new(args.bind_address.parse()?);
    let end_point = Arc::new(EndPoint::new(config, Arc::new(HmacTokenProvider::new(args.secret.as_bytes())))?);
    end_point.set_unhandled_handler(Some(Arc::new(EchoHandler { end_point: Arc::downgrade(&end_point) })));
    end_point.start().await?;

    let mut events = end_point.subscribe_events();

    if let Some(target) = args.search {
        let target: SocketAddr = target.parse()?;
        let peers = end_point.search_at(target, Duration::from_secs(2)).await?;
        for peer in &peers {
            info!("found peer {} at {:?}: {:?}", peer.identity.peer_id, peer.addr, peer.identity.system);

            if args.greet {
                let receipt = end_point.send(peer.addr, b"hello", ReliabilityType::ReliableOrdered, 0).await?;
                match receipt.delivered().await {
                    Ok(()) => info!("greeting to {:?} was acknowledged", peer.addr),
                    Err(e) => warn!("greeting to {:?} failed: {}", peer.addr, e),
                }
            }
        }
    }

    loop {
        select! {
            event = events.recv() => match event {
                Ok(event) => info!("event: {:?}", event),
                Err(e) => error!("event stream: {}", e),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    end_point.stop().await?;
    Ok(())
}
