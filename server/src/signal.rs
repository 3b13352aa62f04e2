//! Signal handling: SIGINT/SIGTERM set the process exit flag.

use std::sync::Arc;

use mm_runtime::RuntimeShared;

pub fn install(rt: Arc<RuntimeShared>) {
    let result = ctrlc::set_handler(move || {
        if rt.exit_requested() {
            tracing::warn!("second signal, exiting immediately");
            std::process::exit(1);
        }
        tracing::info!("shutdown signal received");
        rt.request_exit();
    });
    if let Err(error) = result {
        tracing::warn!(%error, "failed to install signal handler");
    }
}
