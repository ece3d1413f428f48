use std::error::Error;

use log::{debug, info};

use crate::relay::RelayServer;

/// Run the relay server.
///
/// The relay generates its key pair once, then accepts clients
/// indefinitely. Each connection is handled by its own task, so one
/// misbehaving client cannot stall the others.
///
/// # Arguments
/// * `port` - The port to bind on all interfaces (default 4933)
pub async fn run(port: u16) -> Result<(), Box<dyn Error>> {
    let bind_addr = format!("0.0.0.0:{}", port);
    debug!("binding relay to {}", bind_addr);

    let server = RelayServer::bind(&bind_addr).await?;
    println!("Relay listening on {}", server.local_addr()?);
    info!("relay started on {}", bind_addr);

    server.run().await?;
    Ok(())
}
