//! Unix-socket admin command channel.
//!
//! A line-oriented stub: `version` reports the build, `stop` sets the
//! process exit flag, anything else gets `ERROR`.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;

use mm_runtime::net::{UnixAcceptor, UnixConn};
use mm_runtime::{task, RuntimeShared};

const VERSION_LINE: &str = concat!("VERSION ", env!("CARGO_PKG_VERSION"), "\r\n");

pub async fn admin_task(rt: Arc<RuntimeShared>, acceptor: UnixAcceptor, path: PathBuf) {
    loop {
        match acceptor.accept().await {
            Ok(conn) => {
                if let Err(error) = serve_one(&rt, conn).await {
                    tracing::debug!(%error, "admin connection ended");
                }
            }
            Err(mm_runtime::Error::Cancelled) => break,
            Err(error) => {
                tracing::warn!(%error, "admin accept failed");
                break;
            }
        }
    }
    let _ = std::fs::remove_file(path);
}

async fn serve_one(rt: &Arc<RuntimeShared>, conn: UnixConn) -> Result<(), mm_runtime::Error> {
    let mut buf = BytesMut::new();
    loop {
        if task::is_cancelled() {
            return Ok(());
        }
        let newline = buf.iter().position(|&b| b == b'\n');
        let line_end = match newline {
            Some(pos) => pos,
            None => {
                conn.recv(&mut buf).await?;
                continue;
            }
        };
        let line: Vec<u8> = buf.split_to(line_end + 1)[..line_end]
            .trim_ascii()
            .to_vec();
        match line.as_slice() {
            b"version" => conn.send_all(VERSION_LINE.as_bytes()).await?,
            b"stop" => {
                conn.send_all(b"OK\r\n").await?;
                tracing::info!("stop requested over admin channel");
                rt.request_exit();
                return Ok(());
            }
            b"" => {}
            _ => conn.send_all(b"ERROR\r\n").await?,
        }
    }
}
