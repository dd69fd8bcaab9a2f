//! crashscand - browser upload server for crashscan
//!
//! This daemon:
//! 1. Loads configuration (`CRASHSCAN_CONFIG` file, then environment)
//! 2. Serves the upload page and the `/analyze` endpoint
//! 3. Runs until Ctrl-C

use anyhow::Result;
use std::sync::mpsc;

use crashscan::{api::ApiServer, ClassifierKind, ScanConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = ScanConfig::load()?;
    if cfg.classifier.kind == ClassifierKind::OpenAi && cfg.classifier.api_key.is_none() {
        log::warn!("OPENAI_API_KEY is not set; uploads will be rejected until it is");
    }
    log::info!(
        "sampling every {} frame(s), default fps {}, classifier {:?} ({})",
        cfg.sampling.stride,
        cfg.sampling.default_fps,
        cfg.classifier.kind,
        cfg.classifier.model
    );

    let api_handle = ApiServer::new(cfg).spawn()?;
    log::info!("upload page at http://{}/", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("crashscand waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping upload server...");
    api_handle.stop()?;

    Ok(())
}
