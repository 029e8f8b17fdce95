//! Databases with tablespaces served by workers that an in-process bootstrap
//! controller deploys over real sockets.

use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::thread;
use std::time::Duration;

use blockio::correlation::CorrelationId;
use blockio::error::{Error, TransportError};
use blockio::request::{Operation, Response};
use blockio::test::init_test_logger;
use blockio::wire::{decode, encode, Frame};
use blockio::{
    Block, BootstrapController, ClusterIoManager, ControllerHandle, Geometry, IoConfig,
    NodeConfig, RemoteTablespace, TablespaceConfig, TransportKind, VirtualBlock,
};
use blockio_types::StartWorker;
use pretty_assertions::assert_eq;
use uuid::Uuid;

const BLOCK_SIZE: usize = 512;

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn start_controller(dir: &Path) -> ControllerHandle {
    init_test_logger();
    BootstrapController::new(NodeConfig {
        control_address: any_port(),
        remote_directory: Some(dir.join("node")),
        buffer_capacity: 64,
    })
    .listen()
    .unwrap()
}

/// Two tablespaces: 0 local, 1 served through `controller` over `transport`.
fn config(controller: &ControllerHandle, transport: TransportKind) -> IoConfig {
    let mut config = IoConfig::local(2).with_geometry(Geometry::new(BLOCK_SIZE, 4));
    config.tablespaces[1] = TablespaceConfig::Remote(RemoteTablespace {
        transport,
        bootstrap: controller.local_address(),
        master: any_port(),
        slave: any_port(),
    });
    config.reconnect_interval_ms = 100;
    config.bootstrap_timeout_ms = 5_000;
    config
}

/// Exercises every operation on the remote tablespace.
fn round_trip(manager: &ClusterIoManager) {
    assert_eq!(manager.size(1).unwrap(), 0);
    let block = manager.next_free_block(1, None).unwrap();
    assert_eq!(block, VirtualBlock::new(1, 0).unwrap());
    assert_eq!(manager.size(1).unwrap(), 4 * BLOCK_SIZE as u64);

    let page = Block::with_payload(BLOCK_SIZE, b"remote page").unwrap();
    manager.write_block(block, &page).unwrap();
    assert_eq!(manager.read_block(block).unwrap(), page);
    assert_eq!(
        manager.read_block_fully(block).unwrap(),
        page.encode(BLOCK_SIZE).unwrap()
    );

    let extents = manager.next_free_blocks_scan().unwrap();
    assert_eq!(extents[1].next_free, VirtualBlock::new(1, BLOCK_SIZE as u64).unwrap());
    assert_eq!(extents[1].file_size, 4 * BLOCK_SIZE as u64);

    manager.commit().unwrap();
    manager.checkpoint().unwrap();
    manager.force_sync().unwrap();
    assert_eq!(manager.barrier_generation(), 3);
}

#[test]
fn tcp_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let controller = start_controller(dir.path());
    let manager = ClusterIoManager::open(
        dir.path().join("test.db"),
        true,
        config(&controller, TransportKind::Tcp),
    )
    .unwrap();
    assert_eq!(manager.transport(1).unwrap(), TransportKind::Tcp);
    assert_eq!(controller.controller().running(), 1);
    assert!(dir.path().join("node/tablespace1/test.db").exists());

    round_trip(&manager);
    manager.close().unwrap();
    assert_eq!(controller.controller().running(), 0);
}

#[test]
fn mpi_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let controller = start_controller(dir.path());
    let manager = ClusterIoManager::open(
        dir.path().join("test.db"),
        true,
        config(&controller, TransportKind::Mpi),
    )
    .unwrap();
    round_trip(&manager);
    manager.close().unwrap();
    assert_eq!(controller.controller().running(), 0);
}

#[test]
fn udp_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let controller = start_controller(dir.path());
    let manager = ClusterIoManager::open(
        dir.path().join("test.db"),
        true,
        config(&controller, TransportKind::Udp),
    )
    .unwrap();
    round_trip(&manager);
}

#[test]
fn tcp_worker_is_redeployed() {
    let dir = tempfile::tempdir().unwrap();
    let controller = start_controller(dir.path());
    let database = dir.path().join("test.db");
    let manager =
        ClusterIoManager::open(&database, true, config(&controller, TransportKind::Tcp)).unwrap();

    let block = manager.next_free_block(1, None).unwrap();
    let page = Block::with_payload(BLOCK_SIZE, b"before the outage").unwrap();
    manager.write_block(block, &page).unwrap();

    // Kill the worker behind the master's back.  The local tablespace keeps
    // working, and the remote one comes back once the master has redeployed
    // its worker.
    assert!(controller.controller().stop(&database, 1));
    assert!(manager.next_free_block(0, None).is_ok());
    assert_eq!(manager.read_block(block).unwrap(), page);
    assert_eq!(controller.controller().running(), 1);

    let page = Block::with_payload(BLOCK_SIZE, b"after the outage").unwrap();
    manager.write_block(block, &page).unwrap();
    assert_eq!(manager.read_block(block).unwrap(), page);
    manager.commit().unwrap();
}

#[test]
fn requests_outstanding_during_an_outage_complete() {
    let dir = tempfile::tempdir().unwrap();
    let controller = start_controller(dir.path());
    let database = dir.path().join("test.db");
    let mut config = config(&controller, TransportKind::Tcp);
    config.reconnect_interval_ms = 500;
    let manager = ClusterIoManager::open(&database, true, config).unwrap();

    let block = manager.next_free_block(1, None).unwrap();
    let page = Block::with_payload(BLOCK_SIZE, b"outlives its worker").unwrap();
    manager.write_block(block, &page).unwrap();

    // With the worker gone, both requests go out on a dead link, or are held
    // while it is down, and are sent again once the worker is redeployed.
    assert!(controller.controller().stop(&database, 1));
    assert_eq!(controller.controller().running(), 0);
    thread::scope(|s| {
        let commit = s.spawn(|| manager.commit());
        assert_eq!(manager.read_block(block).unwrap(), page);
        commit.join().unwrap().unwrap();
    });
    assert_eq!(controller.controller().running(), 1);
    assert_eq!(manager.barrier_generation(), 1);
    manager.close().unwrap();
}

#[test]
fn unanswered_udp_requests_fail() {
    let dir = tempfile::tempdir().unwrap();
    let controller = start_controller(dir.path());
    let database = dir.path().join("test.db");
    let mut config = config(&controller, TransportKind::Udp);
    config.udp.retry_timeout_ms = Some(50);
    config.udp.max_retries = 2;
    let manager = ClusterIoManager::open(&database, true, config).unwrap();
    assert_eq!(manager.size(1).unwrap(), 0);

    assert!(controller.controller().stop(&database, 1));
    match manager.size(1) {
        Err(Error::Transport(TransportError::Unanswered {
            tablespace,
            attempts,
        })) => assert_eq!((tablespace, attempts), (1, 3)),
        other => panic!("expected the request to go unanswered, got {other:?}"),
    }
    assert_eq!(manager.size(0).unwrap(), BLOCK_SIZE as u64);
}

#[test]
fn udp_worker_replays_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let controller = start_controller(dir.path());
    let socket = UdpSocket::bind(any_port()).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let worker = controller
        .controller()
        .start(&StartWorker {
            database: dir.path().join("test.db"),
            tablespace: 3,
            transport: TransportKind::Udp,
            master: socket.local_addr().unwrap(),
            slave: any_port(),
            geometry: Geometry::new(BLOCK_SIZE, 4),
            session: Uuid::now_v7(),
        })
        .unwrap();

    let allocate = |id: u64| -> Response {
        let request = Frame::Request {
            id: CorrelationId::from_raw(id),
            tablespace: 3,
            operation: Operation::NextFreeBlock { known_free: None },
        };
        socket.send_to(&encode(&request).unwrap(), worker).unwrap();
        let mut buffer = vec![0; 65_536];
        let (len, _) = socket.recv_from(&mut buffer).unwrap();
        match decode::<Frame>(&buffer[..len]).unwrap() {
            Frame::Response(response) => response,
            other => panic!("expected a response, got {other:?}"),
        }
    };

    let first = allocate(1);
    let replayed = allocate(1);
    let second = allocate(2);
    assert_eq!(first.id, CorrelationId::from_raw(1));
    assert_eq!(replayed.long_return, first.long_return);
    assert_eq!(second.id, CorrelationId::from_raw(2));
    assert_eq!(
        VirtualBlock::from_raw(second.long_return as u64).offset(),
        VirtualBlock::from_raw(first.long_return as u64).offset() + BLOCK_SIZE as u64
    );
}
