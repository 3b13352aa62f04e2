//! Admin channel and lifecycle tests.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use mm_server::config::{Mode, ServerConfig};
use mm_server::Server;

fn base_config() -> ServerConfig {
    ServerConfig {
        cores: 1,
        partitions: 1,
        mode: Mode::Locking,
        listen: "127.0.0.1:0".parse().unwrap(),
        admin_sock: None,
        ..ServerConfig::default()
    }
}

#[test]
fn starts_and_shuts_down_cleanly() {
    let server = Server::start(&base_config()).unwrap();
    // The listener is live before we tear down.
    let probe = std::net::TcpStream::connect(server.addr());
    assert!(probe.is_ok());
    drop(probe);
    server.shutdown();
}

#[test]
fn admin_channel_version_and_stop() {
    let sock_path = std::env::temp_dir().join(format!("mm-admin-{}.sock", std::process::id()));
    let config = ServerConfig {
        admin_sock: Some(sock_path.clone()),
        ..base_config()
    };
    let server = Server::start(&config).unwrap();

    let mut admin = UnixStream::connect(&sock_path).expect("admin socket connect");
    admin
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    admin.write_all(b"version\n").unwrap();
    let mut buf = [0u8; 128];
    let n = admin.read(&mut buf).unwrap();
    assert!(buf[..n].starts_with(b"VERSION "), "got {:?}", &buf[..n]);

    admin.write_all(b"bogus\n").unwrap();
    let n = admin.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ERROR\r\n");

    admin.write_all(b"stop\n").unwrap();
    let n = admin.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"OK\r\n");

    let shared = server.shared();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !shared.exit_requested() {
        assert!(std::time::Instant::now() < deadline, "exit flag never set");
        std::thread::sleep(Duration::from_millis(10));
    }
    server.shutdown();
    let _ = std::fs::remove_file(&sock_path);
}
