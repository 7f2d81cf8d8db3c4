//! Tests for the control channel FIFO

mod common;

use common::{supervisor, FakeHost, FakeSpawner};
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::Duration;
use tabinit::control::MAGIC;
use tabinit::signals::event_channel;
use tabinit::{
    ControlClient, ControlEvent, ControlRequest, ControlServer, Init, InittabLoader, Runlevel,
    SupervisorConfig, TableLoader,
};
use tempfile::TempDir;

const TABLE: &str = "a:23:respawn:true\nb:3:once:true\n";

/// Send until the server has the FIFO open.
async fn send(client: &ControlClient, request: ControlRequest) {
    for _ in 0..200 {
        if client.send(&request).is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("control channel never became writable");
}

/// Write raw bytes once the server has the FIFO open.
async fn write_raw(path: &Path, bytes: &[u8]) {
    for _ in 0..200 {
        let opened = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path);
        if let Ok(mut fifo) = opened {
            fifo.write_all(bytes).unwrap();
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("control channel never became writable");
}

fn is_fifo(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_bind_creates_private_fifo_over_stale_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run").join("initctl");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"stale").unwrap();

    let (tx, _rx) = event_channel();
    ControlServer::new(&path, tx).bind().unwrap();

    assert!(is_fifo(&path));
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_bad_magic_is_dropped_and_server_continues() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("initctl");
    let (tx, mut rx) = event_channel();
    let server = tokio::spawn(ControlServer::new(&path, tx).run());

    let client = ControlClient::new(&path);
    let mut bogus = ControlRequest::change_runlevel(3);
    bogus.magic = *b"XXXX";
    send(&client, bogus).await;
    send(&client, ControlRequest::change_runlevel(3)).await;

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ControlEvent::ChangeRunlevel(Runlevel::new("3").unwrap()));
    assert!(rx.try_recv().is_err());
    assert!(!server.is_finished());

    server.abort();
}

#[tokio::test]
async fn test_short_write_does_not_misalign_later_frames() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("initctl");
    let (tx, mut rx) = event_channel();
    let server = tokio::spawn(ControlServer::new(&path, tx).run());

    write_raw(&path, b"junk!").await;
    send(&ControlClient::new(&path), ControlRequest::change_runlevel(3)).await;

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ControlEvent::ChangeRunlevel(Runlevel::new("3").unwrap()));

    // A later frame is still read on its own boundary
    send(&ControlClient::new(&path), ControlRequest::shutdown()).await;
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ControlEvent::Shutdown);

    server.abort();
}

#[tokio::test]
async fn test_shutdown_frame() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("initctl");
    let (tx, mut rx) = event_channel();
    let server = tokio::spawn(ControlServer::new(&path, tx).run());

    let client = ControlClient::new(&path);
    send(&client, ControlRequest::shutdown()).await;

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ControlEvent::Shutdown);
    server.abort();
}

#[tokio::test]
async fn test_client_without_server_fails() {
    let dir = TempDir::new().unwrap();
    let client = ControlClient::new(dir.path().join("initctl"));
    assert!(client.shutdown().is_err());
}

#[tokio::test]
async fn test_frame_matches_direct_runlevel_change() {
    let config = SupervisorConfig {
        require_pid1: false,
        mount_filesystems: false,
        ..SupervisorConfig::default()
    };

    // Direct call
    let direct_spawner = FakeSpawner::new();
    let direct = supervisor(direct_spawner.clone());
    let direct_init = Init::from_parts(config.clone(), direct.clone(), FakeHost::new(direct.clone(), ""));
    direct_init.controller().set_table(InittabLoader.parse(TABLE)).await;
    direct_init
        .controller()
        .change_runlevel(Runlevel::new("3").unwrap())
        .await;

    // Through the FIFO and the dispatcher
    let fifo_spawner = FakeSpawner::new();
    let via_fifo = supervisor(fifo_spawner.clone());
    let fifo_init = Init::from_parts(config, via_fifo.clone(), FakeHost::new(via_fifo.clone(), ""));
    fifo_init.controller().set_table(InittabLoader.parse(TABLE)).await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("initctl");
    let (tx, mut rx) = event_channel();
    let server = tokio::spawn(ControlServer::new(&path, tx).run());

    let frame = ControlRequest {
        magic: MAGIC,
        command: 0,
        argument: 3,
    };
    send(&ControlClient::new(&path), frame).await;
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!fifo_init.handle_event(event).await);
    server.abort();

    assert_eq!(via_fifo.running().await, direct.running().await);
    assert_eq!(fifo_spawner.spawned(), direct_spawner.spawned());
    assert_eq!(
        fifo_init.controller().current().await,
        direct_init.controller().current().await
    );
}
