use std::env;

use fhirgate_server::config::loader::load_config;
use fhirgate_server::{ServerBuilder, apply_logging_level, init_tracing};

#[tokio::main]
async fn main() {
    // .env is optional, for local development only.
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    init_tracing();

    let config_path = env::args()
        .skip_while(|a| a != "--config")
        .nth(1)
        .or_else(|| env::var("FHIRGATE_CONFIG").ok());
    let cfg = match load_config(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    apply_logging_level(&cfg.logging.level);
    tracing::info!(
        backend = %cfg.backend.base_url,
        pre_processors = ?cfg.pipeline.pre_processors,
        post_processors = ?cfg.pipeline.post_processors,
        "configuration loaded"
    );

    let server = match ServerBuilder::new(cfg).build() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Startup error: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = server.run().await {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}
