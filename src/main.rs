//! packice-rs: peer server entry point.

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use packice_rs::{Args, Config, PeerServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let log_level = if args.debug {
        Level::DEBUG
    } else if args.silent {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let config = Config::from(args);
    let server = PeerServer::new(config);

    println!(
        r#"
packice peer is starting at {}

Connect with:
  {}            (HTTP transport)
"#,
        server.bind_address(),
        server.base_url()
    );

    server.run().await?;
    Ok(())
}
