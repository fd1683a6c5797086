//! Meshcast demo binary
//!
//! Runs a distributor and a handful of forwarders in one process over the
//! in-memory transport, waits for the mesh to form and pushes one block.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use meshcast_node::{logging, Advertise, Distributor, Forwarder, NodeConfig};
use meshcast_protocols::MemoryNetwork;

const FORWARDERS: u16 = 4;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("meshcast=info");

    let config = NodeConfig::from_env()?;
    tracing::info!(?config, "Starting Meshcast demo swarm");

    let network = MemoryNetwork::new();
    let address = SocketAddr::from(([127, 0, 0, 1], 5000));
    let distributor = Distributor::new(address, config.clone());
    distributor.serve(network.listen(address)?);

    let mut forwarders = Vec::new();
    for i in 0..FORWARDERS {
        let port = 6000 + i;
        let listener = network.listen(SocketAddr::from(([127, 0, 0, 1], port)))?;
        let (forwarder, blocks) =
            Forwarder::join(Arc::new(network.clone()), address, Advertise::Port(port), config.clone()).await?;
        forwarder.serve(listener);
        forwarders.push((forwarder, blocks));
    }

    while distributor.meshes().first().map_or(0, |mesh| mesh.len()) < FORWARDERS as usize {
        tokio::time::sleep(config.ack_interval).await;
    }
    tracing::info!(mesh = ?distributor.meshes().first(), "Mesh formed");

    let payload = Bytes::from(vec![0x5a; 1 << 20]);
    let report = distributor.push_block(payload, 0).await?;
    tracing::info!(succeeded = report.succeeded.len(), failed = report.failed.len(), "Push finished");

    for (forwarder, blocks) in &mut forwarders {
        match tokio::time::timeout(Duration::from_secs(10), blocks.recv()).await {
            Ok(Some(block)) => tracing::info!(
                forwarder = %forwarder.identity(),
                size = block.payload.len(),
                "Block received"
            ),
            _ => tracing::warn!(forwarder = %forwarder.identity(), "Block not received"),
        }
    }

    distributor.shutdown();
    Ok(())
}
