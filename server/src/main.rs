use clap::Parser;

use mm_server::config::ServerConfig;
use mm_server::logging;

fn main() {
    let config = ServerConfig::parse();
    logging::init(&config);

    if let Err(error) = mm_server::run(config) {
        tracing::error!(%error, "fatal");
        std::process::exit(1);
    }
}
