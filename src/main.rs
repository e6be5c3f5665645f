use log::error;
use tokio::sync::broadcast;

use sax_bridge::options::Options;

#[tokio::main]
async fn main() {
    let options = Options::new();

    let (shutdown_tx, _) = broadcast::channel(1);

    // Handle Ctrl+C
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
        }
        let _ = shutdown_tx_clone.send(());
    });

    let app_handle = tokio::spawn(sax_bridge::app(shutdown_tx.subscribe(), options));

    match app_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            eprintln!("{:?}", err);
            std::process::exit(255);
        }
        Err(err) => {
            eprintln!("{:?}", err);
            std::process::exit(255);
        }
    }
}
