//! End-to-end transfers between two real peers on loopback.
//!
//! The receiving peer serves in a background task until the sender
//! terminates; its [`MemorySink`] is cloned beforehand so the test can read
//! back what was delivered.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use udp_duplex::socket::Socket;
use udp_duplex::{
    Delivery, DirectorySink, MemorySink, Peer, Role, ServeOutcome, SessionConfig, SessionError,
    SessionState, StorageSink, Timeouts, TransferJob,
};

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

fn fast_config(seed: u64) -> SessionConfig {
    SessionConfig {
        timeouts: Timeouts {
            handshake: Duration::from_secs(1),
            receiver_idle: Duration::from_secs(3),
            ack: Duration::from_millis(300),
            listen: Duration::from_millis(500),
            heartbeat_base: Duration::from_millis(200),
            heartbeat_max_failures: 3,
        },
        seed: Some(seed),
        ..SessionConfig::default()
    }
}

struct Session {
    client: Peer<MemorySink>,
    server: JoinHandle<Result<ServeOutcome, SessionError>>,
    received: MemorySink,
}

/// Connect a client to a serving receiver.
async fn session(seed: u64) -> Session {
    let server_socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let server_addr: SocketAddr = server_socket.local_addr;
    let received = MemorySink::new();
    let sink = received.clone();

    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(server_socket, fast_config(seed), sink).await?;
        let (_console_tx, mut console_rx) = mpsc::channel(1);
        peer.serve(&mut console_rx).await
    });

    let client_socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client = Peer::connect(client_socket, server_addr, fast_config(seed), MemorySink::new())
        .await
        .expect("connect");

    Session {
        client,
        server,
        received,
    }
}

impl Session {
    /// Terminate from the client and return what the receiver stored.
    async fn finish(mut self) -> Vec<Delivery> {
        self.client.terminate().await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), self.server)
            .await
            .expect("receiver did not stop")
            .expect("receiver panicked")
            .expect("receiver failed");
        assert_eq!(outcome, ServeOutcome::Terminated);
        self.received.deliveries()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// "HELLOX" at 6 B per fragment travels as a single fragment.
#[tokio::test]
async fn single_fragment_message() {
    let mut s = session(1).await;

    let job = TransferJob::text("HELLOX", 6, 0.0).unwrap();
    let report = s.client.send(&job).await.unwrap();
    assert_eq!(report.fragments, 1);
    assert_eq!(report.bytes, 6);
    assert_eq!(report.transmissions, 1);
    assert!(report.end_acknowledged);
    assert_eq!(s.client.state(), SessionState::Idle);

    assert_eq!(s.finish().await, vec![Delivery::Text("HELLOX".into())]);
}

/// "HELLOX" at 4 B per fragment is split as "HELL" + "OX" and rejoined.
#[tokio::test]
async fn fragmented_message_is_reassembled() {
    let mut s = session(2).await;

    let job = TransferJob::text("HELLOX", 4, 0.0).unwrap();
    let report = s.client.send(&job).await.unwrap();
    assert_eq!(report.fragments, 2);
    assert_eq!(report.transmissions, 2);
    assert_eq!(report.rejects, 0);
    assert_eq!(report.timeouts, 0);

    assert_eq!(s.finish().await, vec![Delivery::Text("HELLOX".into())]);
}

/// A multi-byte character split across fragments survives reassembly.
#[tokio::test]
async fn utf8_split_across_fragments() {
    let mut s = session(3).await;

    let text = "žluťoučký kůň";
    let job = TransferJob::text(text, 3, 0.0).unwrap();
    s.client.send(&job).await.unwrap();

    assert_eq!(s.finish().await, vec![Delivery::Text(text.into())]);
}

/// A file is announced at sequence 0, then sent as data fragments.
#[tokio::test]
async fn file_transfer_delivers_name_and_content() {
    let mut s = session(4).await;

    let content = b"\x01\x02\x03\x04\x05".to_vec();
    let job = TransferJob::file("a.bin", content.clone(), 2, 0.0).unwrap();
    let report = s.client.send(&job).await.unwrap();
    // Announcement plus three data fragments of 2, 2 and 1 bytes.
    assert_eq!(report.fragments, 3);
    assert_eq!(report.bytes, 5);
    assert_eq!(report.transmissions, 4);

    assert_eq!(
        s.finish().await,
        vec![Delivery::File {
            name: "a.bin".into(),
            content
        }]
    );
}

/// Several transfers in a row on one session stay separate.
#[tokio::test]
async fn consecutive_transfers() {
    let mut s = session(5).await;

    s.client
        .send(&TransferJob::text("first", 2, 0.0).unwrap())
        .await
        .unwrap();
    s.client
        .send(&TransferJob::file("b.txt", b"second".to_vec(), 5, 0.0).unwrap())
        .await
        .unwrap();
    s.client
        .send(&TransferJob::text("third", 1467, 0.0).unwrap())
        .await
        .unwrap();

    assert_eq!(
        s.finish().await,
        vec![
            Delivery::Text("first".into()),
            Delivery::File {
                name: "b.txt".into(),
                content: b"second".to_vec()
            },
            Delivery::Text("third".into()),
        ]
    );
}

/// Injected corruption forces resends, but everything arrives intact.
#[tokio::test]
async fn corrupted_fragments_are_resent() {
    let mut s = session(42).await;

    let text = "the quick brown fox jumps over the lazy dog";
    let job = TransferJob::text(text, 2, 0.8).unwrap();
    let report = s.client.send(&job).await.unwrap();

    assert_eq!(report.fragments, 22);
    assert!(report.rejects > 0, "0.8 error rate over 22 fragments: {report:?}");
    assert_eq!(report.transmissions as usize, report.fragments + report.rejects as usize);
    assert_eq!(report.timeouts, 0);

    assert_eq!(s.finish().await, vec![Delivery::Text(text.into())]);
}

/// An empty message still produces a (empty) delivery.
#[tokio::test]
async fn empty_message() {
    let mut s = session(6).await;

    let report = s
        .client
        .send(&TransferJob::text("", 4, 0.0).unwrap())
        .await
        .unwrap();
    assert_eq!(report.fragments, 0);
    assert!(report.end_acknowledged);

    assert_eq!(s.finish().await, vec![Delivery::Text(String::new())]);
}

/// Fails its first delivery, then records like a [`MemorySink`].
struct FailsOnceSink {
    failed: bool,
    inner: MemorySink,
}

impl StorageSink for FailsOnceSink {
    fn deliver_text(&mut self, text: String) -> io::Result<()> {
        if !self.failed {
            self.failed = true;
            return Err(io::Error::other("disk full"));
        }
        self.inner.deliver_text(text)
    }

    fn deliver_file(&mut self, name: &str, fragments: &[Vec<u8>]) -> io::Result<()> {
        if !self.failed {
            self.failed = true;
            return Err(io::Error::other("disk full"));
        }
        self.inner.deliver_file(name, fragments)
    }
}

/// A failing sink costs one transfer, not the session: the sender still
/// gets its end acknowledgement and the receiver can serve again.
#[tokio::test]
async fn storage_failure_keeps_session_usable() {
    let server_socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let server_addr = server_socket.local_addr;
    let received = MemorySink::new();
    let sink = FailsOnceSink {
        failed: false,
        inner: received.clone(),
    };

    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(server_socket, fast_config(7), sink).await?;
        let (_console_tx, mut console_rx) = mpsc::channel(1);
        let first = peer.serve(&mut console_rx).await;
        assert!(matches!(first, Err(SessionError::Storage(_))), "{first:?}");
        assert_eq!(peer.state(), SessionState::Idle);
        assert_eq!(peer.role(), Role::Receiver);
        peer.serve(&mut console_rx).await
    });

    let client_socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let mut client = Peer::connect(client_socket, server_addr, fast_config(7), MemorySink::new())
        .await
        .unwrap();

    let lost = client
        .send(&TransferJob::text("lost", 2, 0.0).unwrap())
        .await
        .unwrap();
    assert!(lost.end_acknowledged);
    let kept = client
        .send(&TransferJob::text("kept", 2, 0.0).unwrap())
        .await
        .unwrap();
    assert!(kept.end_acknowledged);
    client.terminate().await.unwrap();

    let outcome = timeout_join(server).await.expect("second serve failed");
    assert_eq!(outcome, ServeOutcome::Terminated);
    assert_eq!(received.deliveries(), vec![Delivery::Text("kept".into())]);
}

/// A file announced as ".." is refused by the directory sink; the receiver
/// reports it and keeps serving.
#[tokio::test]
async fn unusable_file_name_is_not_fatal() {
    let dir = std::env::temp_dir().join(format!("udp-duplex-names-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let server_socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let server_addr = server_socket.local_addr;
    let sink = DirectorySink::with_console(&dir, Vec::new());

    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(server_socket, fast_config(8), sink).await?;
        let (_console_tx, mut console_rx) = mpsc::channel(1);
        let first = peer.serve(&mut console_rx).await;
        assert!(matches!(first, Err(SessionError::Storage(_))), "{first:?}");
        peer.serve(&mut console_rx).await
    });

    let client_socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let mut client = Peer::connect(client_socket, server_addr, fast_config(8), MemorySink::new())
        .await
        .unwrap();
    client
        .send(&TransferJob::file("..", b"escape".to_vec(), 8, 0.0).unwrap())
        .await
        .unwrap();
    client
        .send(&TransferJob::file("ok.txt", b"fine".to_vec(), 8, 0.0).unwrap())
        .await
        .unwrap();
    client.terminate().await.unwrap();

    let outcome = timeout_join(server).await.expect("second serve failed");
    assert_eq!(outcome, ServeOutcome::Terminated);
    assert_eq!(std::fs::read(dir.join("ok.txt")).unwrap(), b"fine");
    std::fs::remove_dir_all(&dir).unwrap();
}

async fn timeout_join(
    server: JoinHandle<Result<ServeOutcome, SessionError>>,
) -> Result<ServeOutcome, SessionError> {
    tokio::time::timeout(Duration::from_secs(3), server)
        .await
        .expect("receiver did not stop")
        .expect("receiver panicked")
}
