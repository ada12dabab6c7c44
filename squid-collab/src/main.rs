use log::{error, info};
use squid_collab::{BoardServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    info!(
        "Starting Squid board server on {} (storage: {})",
        config.bind_addr,
        config.storage_path.display()
    );

    let server = match BoardServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open board store: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
