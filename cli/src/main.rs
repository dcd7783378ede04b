use std::time::Duration;
use anyhow::Result;
use clap::{Parser, Subcommand};
use discovery::{Discovery, DiscoveryConfig, DiscoveryEvent, EventRx, TrackerAddr};

#[derive(Parser)]
#[command(name = "dns-discovery", about = "Discover peers over DNS and mDNS")]
struct Args {

    // Tracker addresses, host[:port[,secondaryPort]]. Repeatable.
    #[arg(short, long)]
    tracker: Vec<TrackerAddr>,

    #[arg(long, default_value = "dns-discovery.local")]
    domain: String,

    // Peer expiry in seconds, 0 to keep peers forever.
    #[arg(long, default_value_t = 0)]
    ttl: u64,

    #[arg(long)]
    no_multicast: bool,

    // Announce with port "0" so trackers use the observed source port.
    #[arg(long)]
    implied_port: bool,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,

}

#[derive(Subcommand)]
enum CliCommand {

    // Run as a tracker.
    Listen {
        #[arg(help = "Ports to bind, defaults to 53 and 5300")]
        ports: Vec<u16>,
    },

    Announce { topic: String, port: u16 },

    Unannounce { topic: String, port: u16 },

    Lookup { topic: String },

    // Ask the trackers how they see us.
    Whoami,

}

#[tokio::main]
async fn main() -> Result<()> {

    let args = Args::parse();

    // Set up logging.
    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let sub = tracing_subscriber::fmt()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(sub)?;

    let config = DiscoveryConfig {
        domain: args.domain,
        trackers: args.tracker,
        multicast: !args.no_multicast,
        implied_port: args.implied_port,
        ttl: if args.ttl == 0 { None } else { Some(Duration::from_secs(args.ttl)) },
        ..Default::default()
    };
    let (disco, events) = Discovery::new(config).await?;

    match args.command {

        CliCommand::Listen { ports } => {
            disco.listen(&ports).await?;
            watch(events).await;
        }

        CliCommand::Announce { topic, port } => {
            disco.announce(topic.as_str(), port).await?;
            tracing::info!("announced {}:{}", topic, port);
            // Stay registered and print peers as they surface.
            watch(events).await;
        }

        CliCommand::Unannounce { topic, port } => {
            disco.unannounce(topic.as_str(), port).await?;
            tracing::info!("unannounced {}:{}", topic, port);
            disco.destroy().await?;
        }

        CliCommand::Lookup { topic } => {
            disco.lookup(topic.as_str()).await?;
            watch(events).await;
        }

        CliCommand::Whoami => {
            let observed = disco.whoami().await?;
            println!("{}", observed);
            disco.destroy().await?;
        }

    }

    Ok(())
}

async fn watch(mut events: EventRx) {
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::Peer { topic, peer } => println!("{} {}", topic, peer),
            DiscoveryEvent::Listening => tracing::info!("all sockets bound"),
            DiscoveryEvent::Error(e) => tracing::warn!("{}", e),
            DiscoveryEvent::Close => break,
        }
    }
}
