//! Full transfer protocol over localhost TCP: a primary streams its
//! latest checkpoint to a fresh follower, the follower swaps it in, and
//! both ends agree byte-for-byte.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use riffle_core::{
    CoreId, CoreMeta, CoreOptions, Instruction, Location, MpuId, NoTransport, ReplicaTransport,
    StorageCore, TransportError,
};
use riffle_net::{CoreServer, TcpTransport};
use riffle_storage::ScanRange;

fn meta(label: &str, core_id: u64, port: u16) -> CoreMeta {
    CoreMeta::new(
        MpuId(1),
        CoreId(core_id),
        label,
        Location::new("127.0.0.1", port),
    )
}

fn put_at(core: &StorageCore, clock: u64, key: &[u8], value: &[u8]) {
    core.save_instruction(clock, b"op").unwrap();
    core.tick(clock).unwrap();
    let mut writer = core
        .writer(Instruction {
            clock,
            payload: b"op".to_vec(),
        })
        .unwrap();
    writer.put(key.to_vec(), value.to_vec());
    core.flush(writer).unwrap();
}

/// Runs a `CoreServer` for `cores` on its own runtime thread, returning
/// the bound address.
fn spawn_server(cores: Vec<Arc<StorageCore>>) -> SocketAddr {
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let server = CoreServer::new(cores);
            let _ = server.serve(listener).await;
        });
    });
    addr_rx.recv().unwrap()
}

fn open_follower(root: &Path) -> Arc<StorageCore> {
    StorageCore::open(
        meta("follower", 2, 0),
        CoreOptions::new(root),
        Arc::new(NoTransport),
    )
    .unwrap()
}

#[test]
fn test_transfer_to_fresh_follower() {
    let primary_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();

    let follower = open_follower(follower_dir.path());
    let addr = spawn_server(vec![Arc::clone(&follower)]);
    let follower_meta = meta("follower", 2, addr.port());

    let primary = StorageCore::open(
        meta("primary", 1, 0),
        CoreOptions::new(primary_dir.path()),
        Arc::new(TcpTransport::new().unwrap()),
    )
    .unwrap();
    for clock in 1..=100u64 {
        put_at(
            &primary,
            clock,
            format!("key-{clock:03}").as_bytes(),
            format!("value-{clock}").as_bytes(),
        );
    }

    primary.transfer_to(&follower_meta).unwrap();

    assert_eq!(follower.clocked().unwrap(), 100);

    let primary_rows: Vec<_> = primary
        .reader()
        .unwrap()
        .scan(&ScanRange::all())
        .unwrap()
        .collect();
    let follower_rows: Vec<_> = follower
        .reader()
        .unwrap()
        .scan(&ScanRange::all())
        .unwrap()
        .collect();
    assert_eq!(primary_rows.len(), 100);
    assert_eq!(primary_rows, follower_rows);
}

#[test]
fn test_transfer_is_repeatable() {
    let primary_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();

    let follower = open_follower(follower_dir.path());
    let addr = spawn_server(vec![Arc::clone(&follower)]);
    let follower_meta = meta("follower", 2, addr.port());

    let primary = StorageCore::open(
        meta("primary", 1, 0),
        CoreOptions::new(primary_dir.path()),
        Arc::new(TcpTransport::new().unwrap()),
    )
    .unwrap();

    put_at(&primary, 1, b"k1", b"v1");
    primary.transfer_to(&follower_meta).unwrap();
    assert_eq!(follower.clocked().unwrap(), 1);

    // The primary advances; a second whole-transfer catches the follower up.
    put_at(&primary, 2, b"k2", b"v2");
    primary.transfer_to(&follower_meta).unwrap();

    assert_eq!(follower.clocked().unwrap(), 2);
    assert_eq!(
        follower.reader().unwrap().get(b"k2").unwrap(),
        Some(b"v2".to_vec())
    );
}

#[test]
fn test_transfer_backup_unknown_core_is_remote_error() {
    let follower_dir = tempfile::tempdir().unwrap();
    let follower = open_follower(follower_dir.path());
    let addr = spawn_server(vec![follower]);

    let transport = TcpTransport::new().unwrap();
    let wrong = meta("ghost", 99, addr.port());
    match transport.transfer_backup(&wrong) {
        Err(TransportError::Remote(message)) => {
            assert!(message.contains("no core"), "unexpected message: {message}");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[test]
fn test_rpc_against_dead_port_is_io_error() {
    let transport = TcpTransport::with_timeout(Duration::from_secs(1)).unwrap();
    // Port 1 on localhost refuses connections.
    let target = meta("nobody", 1, 1);
    match transport.transfer_backup(&target) {
        Err(TransportError::Io(_)) => {}
        other => panic!("expected io error, got {other:?}"),
    }
}

#[test]
fn test_file_stream_replaces_existing_file() {
    let follower_dir = tempfile::tempdir().unwrap();
    let follower = open_follower(follower_dir.path());
    let addr = spawn_server(vec![Arc::clone(&follower)]);
    let follower_meta = meta("follower", 2, addr.port());

    let staging = follower.receive_backup().unwrap();
    std::fs::write(staging.join("payload.bin"), b"stale").unwrap();

    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("payload.bin"), b"fresh contents").unwrap();

    let transport = TcpTransport::new().unwrap();
    transport
        .send_directory(&follower_meta, source.path(), &staging)
        .unwrap();

    assert_eq!(
        std::fs::read(staging.join("payload.bin")).unwrap(),
        b"fresh contents"
    );
}
