//! Network integration tests
//!
//! Runs the TCP dispatcher on an ephemeral port and queries it with the
//! blocking network client.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use veil_client::{ClientBuilder, ClientError, ClientSession, NetworkClient};
use veil_core::params::test_params;
use veil_core::wire::{self, QueryRequest};
use veil_core::{
    Channel, CryptoContext, Error, Item, MatchRecord, Message, NetworkChannel, ThreadPoolConfig,
    TransparentBackend,
};
use veil_server::{Dispatcher, SenderDb, SharedSenderDb};

/// Dispatcher running on a background task
struct TestServer {
    addr: SocketAddr,
    db: Arc<SharedSenderDb>,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    async fn start(db: SenderDb) -> Self {
        let shared = Arc::new(SharedSenderDb::with_db(db));
        let pool = Arc::new(ThreadPoolConfig::new(2).unwrap().build().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind should succeed");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let dispatcher: Dispatcher<TransparentBackend> = Dispatcher::new(Arc::clone(&shared), pool);
        tokio::spawn(async move {
            dispatcher
                .serve(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            db: shared,
            _shutdown: shutdown_tx,
        }
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

fn labeled_db() -> SenderDb {
    let mut db = SenderDb::new(test_params(), 8, 16, false).unwrap();
    db.insert_or_assign_labeled(&Item::from("alice"), b"admin").unwrap();
    db.insert_or_assign_labeled(&Item::from("bob"), b"staff").unwrap();
    db
}

async fn query(endpoint: String, names: &'static [&'static str]) -> Result<Vec<MatchRecord>, ClientError> {
    tokio::task::spawn_blocking(move || {
        let items: Vec<Item> = names.iter().map(|n| Item::from(*n)).collect();
        let mut client: NetworkClient = ClientBuilder::new(endpoint).build()?;
        client.query(&items)
    })
    .await
    .expect("query task panicked")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_over_tcp() {
    let server = TestServer::start(labeled_db()).await;

    let records = query(server.endpoint(), &["mallory", "bob", "alice"]).await.unwrap();
    assert_eq!(
        records,
        vec![
            MatchRecord::not_found(),
            MatchRecord::found(Some(b"staff".to_vec())),
            MatchRecord::found(Some(b"admin".to_vec())),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queries_see_database_updates() {
    let server = TestServer::start(labeled_db()).await;

    let before = query(server.endpoint(), &["carol"]).await.unwrap();
    assert!(!before[0].found);

    server
        .db
        .update(|db| db.insert_or_assign_labeled(&Item::from("carol"), b"guest"))
        .unwrap();

    let after = query(server.endpoint(), &["carol"]).await.unwrap();
    assert_eq!(after[0].label_string().as_deref(), Some("guest"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_survives_protocol_error() {
    let server = TestServer::start(labeled_db()).await;
    let endpoint = server.endpoint();

    let records = tokio::task::spawn_blocking(move || {
        let mut channel = NetworkChannel::new();
        assert!(channel.connect(&endpoint));

        // A query built for other parameters is answered with nothing
        let stale = QueryRequest {
            params_fingerprint: 0,
            context_id: CryptoContext::from_params(&test_params()).id,
            bundles: Vec::new(),
        };
        channel.send(&Message::QueryRequest(stale)).unwrap();

        let mut session: ClientSession = ClientSession::new();
        session.request_params(&mut channel).unwrap();
        session.request_oprf(&[Item::from("alice")], &mut channel).unwrap();
        session.request_query(&mut channel).unwrap()
    })
    .await
    .unwrap();

    assert_eq!(records, vec![MatchRecord::found(Some(b"admin".to_vec()))]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_frame_drops_connection() {
    let server = TestServer::start(labeled_db()).await;
    let addr = server.addr;

    let result = tokio::task::spawn_blocking(move || {
        use std::io::{Read, Write};

        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        let mut frame = wire::encode(&Message::ParamsRequest(Default::default())).unwrap();
        frame[0] = b'X';
        stream.write_all(&frame).unwrap();

        let mut buf = [0u8; 1];
        stream.read(&mut buf)
    })
    .await
    .unwrap();

    assert_eq!(result.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
    drop(listener);

    assert!(matches!(
        query(endpoint, &["alice"]).await,
        Err(ClientError::Connect(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_query_rejected_before_connecting() {
    assert!(matches!(
        query("tcp://127.0.0.1:9".into(), &[]).await,
        Err(ClientError::Psi(Error::EmptyQuery))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_closes_open_connections() {
    let shared = Arc::new(SharedSenderDb::with_db(labeled_db()));
    let pool = Arc::new(ThreadPoolConfig::new(1).unwrap().build().unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("tcp://{}", listener.local_addr().unwrap());

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let dispatcher: Dispatcher<TransparentBackend> = Dispatcher::new(shared, pool);
    let server = tokio::spawn(dispatcher.serve(listener, async {
        let _ = shutdown_rx.await;
    }));

    // An idle client keeps its connection thread blocked on a read
    let mut channel = tokio::task::spawn_blocking(move || {
        let mut channel = NetworkChannel::new();
        assert!(channel.connect(&endpoint));
        let mut session: ClientSession = ClientSession::new();
        session.request_params(&mut channel).unwrap();
        channel
    })
    .await
    .unwrap();

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(10), server)
        .await
        .expect("dispatcher should stop once connections are closed")
        .unwrap()
        .unwrap();

    let received = tokio::task::spawn_blocking(move || channel.receive_frame().map(|_| ()))
        .await
        .unwrap();
    assert!(matches!(received, Err(Error::TransportError(_))));
}

