//! MainMemory server: wiring between the runtime, the cache engine, the
//! listeners, and the process environment.

pub mod admin;
pub mod config;
pub mod logging;
pub mod signal;

use std::sync::Arc;
use std::time::Duration;

use mm_memcache::{listen_task, CacheConfig, Memcache};
use mm_runtime::net::{TcpAcceptor, UnixAcceptor};
use mm_runtime::{Runtime, RuntimeConfig, RuntimeShared, Work};

use crate::config::ServerConfig;

/// A running server instance.
pub struct Server {
    rt: Runtime,
    shared: Arc<RuntimeShared>,
    cache: Arc<Memcache>,
    addr: std::net::SocketAddr,
}

impl Server {
    /// Build the runtime, install the cache engine, and start listening.
    pub fn start(config: &ServerConfig) -> Result<Server, Box<dyn std::error::Error>> {
        let rt = Runtime::build(RuntimeConfig {
            cores: config.cores,
            workers_max: config.max_workers,
            pin_threads: config.pin_threads,
        })?;
        let shared = rt.shared();
        let ncores = shared.ncores() as u16;

        let nparts = if config.partitions == 0 {
            ncores
        } else {
            config.partitions
        };
        let cache = Memcache::new(&CacheConfig {
            nparts,
            volume: config.volume,
            nbuckets_min: config.buckets_min,
            mode: config.mode.into(),
            ncores,
        });

        let acceptor = TcpAcceptor::bind(config.listen, shared.backend().clone())?;
        let addr = acceptor.local_addr()?;
        tracing::info!(%addr, "memcache listening");

        {
            let rt_for_listener = shared.clone();
            let cache = cache.clone();
            shared.submit(
                0,
                Work::new(move || listen_task(rt_for_listener, cache, acceptor)),
            );
        }

        if let Some(path) = &config.admin_sock {
            let _ = std::fs::remove_file(path);
            match UnixAcceptor::bind(path, shared.backend().clone()) {
                Ok(admin_acceptor) => {
                    let rt_for_admin = shared.clone();
                    let sock_path = path.clone();
                    tracing::info!(path = %sock_path.display(), "admin channel ready");
                    shared.submit(
                        0,
                        Work::new(move || {
                            admin::admin_task(rt_for_admin, admin_acceptor, sock_path)
                        }),
                    );
                }
                Err(error) => {
                    tracing::warn!(%error, "admin channel unavailable");
                }
            }
        }

        Ok(Server {
            rt,
            shared,
            cache,
            addr,
        })
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn shared(&self) -> Arc<RuntimeShared> {
        self.shared.clone()
    }

    pub fn cache(&self) -> Arc<Memcache> {
        self.cache.clone()
    }

    /// Stop every core and wait for the threads to drain.
    pub fn shutdown(self) {
        self.rt.stop();
        self.rt.join();
    }
}

/// Run until the exit flag is raised by a signal or the admin channel.
pub fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::start(&config)?;
    signal::install(server.shared());

    let shared = server.shared();
    while !shared.exit_requested() {
        std::thread::sleep(Duration::from_millis(50));
    }
    tracing::info!("stopping cores");
    server.shutdown();
    if let Some(path) = &config.admin_sock {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}
