//! A minimal multiplexing milter: listens for one MTA and fans every
//! message out to the backend filters named on the command line.
//!
//! ```sh
//! cargo run --example fanout -- 127.0.0.1:7801 127.0.0.1:7802
//! ```

use std::error::Error;

use tokio::net::TcpListener;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{info, warn};

use muxtr::backend::Backend;
use muxtr::{Children, ChildrenConfig};
use muxtr_server::Gateway;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let backends: Vec<Backend> = std::env::args()
        .skip(1)
        .enumerate()
        .map(|(index, endpoint)| Backend::tcp(&format!("filter-{index}"), &endpoint))
        .collect();
    if backends.is_empty() {
        return Err("pass at least one backend filter endpoint".into());
    }

    let listener = TcpListener::bind("127.0.0.1:7357").await?;
    info!(backends = backends.len(), "listening on 127.0.0.1:7357");

    loop {
        let (socket, peer) = listener.accept().await?;
        info!(%peer, "mta connected");

        let children = Children::new(backends.clone(), ChildrenConfig::default());
        let mut gateway = Gateway::new(children);
        tokio::spawn(async move {
            if let Err(error) = gateway.handle(socket.compat()).await {
                warn!(%error, "mta conversation ended abnormally");
            }
        });
    }
}
