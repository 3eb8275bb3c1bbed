use clap::Parser;
use clap_derive::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use svc_endpoint::config::TransportConfig;
use svc_endpoint::context::ContextView;
use svc_endpoint::endpoint::EndpointRef;
use svc_endpoint::handler::ProtocolHandler;
use svc_endpoint::tcp::TcpTransport;
use svc_endpoint::{cc_debug, cc_info};
use tokio::select;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    listen_address: String,

    /// interval for idle notifications, none if omitted
    #[clap(long)]
    timer_millis: Option<u64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

/// Sends every received chunk back to the peer. A line starting with "quit" closes the connection.
struct EchoHandler {
    context: ContextView,
    endpoint: EndpointRef,
}

impl ProtocolHandler for EchoHandler {
    fn on_connection_opened(&self) {
        cc_info!(self.context.load(), "connection opened");
    }

    fn on_bytes_received(&self, buf: &[u8]) -> bool {
        if buf.starts_with(b"quit") {
            return false;
        }
        self.endpoint.send(buf)
    }

    fn on_connection_closed(&self) {
        cc_info!(self.context.load(), "connection closed");
    }

    fn on_timer(&self) {
        cc_debug!(self.context.load(), "idle tick");
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

    let listen_addr: SocketAddr = args.listen_address.parse()?;
    let mut config = TransportConfig::new(listen_addr);
    config.timer_interval = args.timer_millis.map(Duration::from_millis);

    let transport = TcpTransport::new(config, Arc::new(|context: ContextView, endpoint: EndpointRef| -> Arc<dyn ProtocolHandler> {
        Arc::new(EchoHandler { context, endpoint })
    }))?;
    transport.spawn_workers();

    let listener = transport.bind().await?;

    select! {
        result = transport.accept_loop(listener) => { result?; }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    transport.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
