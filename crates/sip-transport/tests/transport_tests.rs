use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sipflow_sip_core::{Message, parse_message};
use sipflow_sip_transport::{
    Connection, ConnectionPool, Error, ErrorKind, ListenOptions, Network, TlsClientConfig,
    TlsServerConfig, TransportConfig, TransportLayer,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

const OPTIONS: &str = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
    Via: SIP/2.0/TCP client.example.com:5070;branch=z9hG4bK74bf9\r\n\
    To: <sip:bob@example.com>\r\n\
    From: <sip:alice@example.com>;tag=9fxced76sl\r\n\
    Call-ID: 3848276298220188511\r\n\
    CSeq: 63104 OPTIONS\r\n\
    Content-Length: 0\r\n\r\n";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sipflow_sip_transport=debug")
        .with_test_writer()
        .try_init();
}

fn duplex_connection(remote: &str) -> (Connection, tokio::io::DuplexStream) {
    let (ours, theirs) = tokio::io::duplex(4096);
    let conn = Connection::stream(
        ours,
        Network::Tcp,
        "127.0.0.1:5060".parse().unwrap(),
        remote.parse().unwrap(),
    );
    (conn, theirs)
}

fn pool() -> (ConnectionPool, mpsc::Receiver<Message>, mpsc::Receiver<Error>) {
    let (mtx, mrx) = mpsc::channel(10);
    let (etx, erx) = mpsc::channel(10);
    (ConnectionPool::new(mtx, etx, CancellationToken::new(), None), mrx, erx)
}

fn request(transport: &str, destination: SocketAddr) -> Message {
    let text = format!(
        "INVITE sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/{} placeholder;branch=z9hG4bK776asdhds;rport\r\n\
         Max-Forwards: 70\r\n\
         To: Bob <sip:bob@example.com>\r\n\
         From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
         Call-ID: a84b4c76e66710@{}\r\n\
         CSeq: 314159 INVITE\r\n\
         Content-Length: 0\r\n\r\n",
        transport, transport
    );
    let mut msg = parse_message(text.as_bytes()).unwrap();
    msg.set_destination(destination.to_string());
    msg
}

fn response_to(request: &Message) -> Message {
    let hop = request.via_hop().unwrap();
    let text = format!(
        "SIP/2.0 200 OK\r\n\
         Via: {}\r\n\
         To: Bob <sip:bob@example.com>;tag=a6c85cf\r\n\
         From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
         Call-ID: {}\r\n\
         CSeq: 314159 INVITE\r\n\
         Content-Length: 0\r\n\r\n",
        hop,
        request.call_id().unwrap()
    );
    let mut msg = parse_message(text.as_bytes()).unwrap();
    msg.set_destination(request.source());
    msg.set_transport(request.transport());
    msg
}

async fn round_trip(network: &str, server_options: ListenOptions, client_config: TransportConfig) {
    init_tracing();

    let server = TransportLayer::new(TransportConfig::default());
    let client = TransportLayer::new(client_config);
    let mut server_msgs = server.messages().unwrap();
    let mut client_msgs = client.messages().unwrap();

    let addr = server
        .listen(network, "127.0.0.1:0", server_options)
        .await
        .unwrap();

    client.send(request(network, addr)).await.unwrap();
    let received = timeout(WAIT, server_msgs.recv()).await.unwrap().unwrap();
    assert!(received.is_request());
    assert_eq!(received.transport(), network.to_ascii_uppercase());
    assert_eq!(received.destination(), addr.to_string());

    server.send(response_to(&received)).await.unwrap();
    let reply = timeout(WAIT, client_msgs.recv()).await.unwrap().unwrap();
    assert!(reply.is_response());
    assert_eq!(reply.call_id(), received.call_id());
    assert_eq!(reply.source(), addr.to_string());

    server.cancel();
    client.cancel();
    timeout(WAIT, server.done()).await.unwrap();
    timeout(WAIT, client.done()).await.unwrap();
}

#[tokio::test]
async fn test_pool_key_uniqueness() {
    let (pool, _mrx, _erx) = pool();

    let (first, _peer1) = duplex_connection("10.0.0.1:40000");
    let key = first.key().clone();
    pool.put(first, Duration::ZERO).unwrap();

    let (second, _peer2) = duplex_connection("10.0.0.1:40000");
    let err = pool.put(second, Duration::ZERO).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Pool);
    assert!(err.to_string().contains("already exists"));
    assert_eq!(pool.len(), 1);

    pool.drop_connection(&key).unwrap();
    assert!(pool.drop_connection(&key).is_err());

    let (third, _peer3) = duplex_connection("10.0.0.1:40000");
    pool.put(third, Duration::ZERO).unwrap();
    assert_eq!(pool.all().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expiry_sliding_window() {
    let (pool, mut mrx, mut erx) = pool();
    let (conn, mut peer) = duplex_connection("10.0.0.2:40000");
    let key = conn.key().clone();
    pool.put(conn, Duration::from_secs(10)).unwrap();

    tokio::time::advance(Duration::from_secs(8)).await;
    peer.write_all(OPTIONS.as_bytes()).await.unwrap();
    mrx.recv().await.unwrap();

    // past the original deadline, inside the renewed lease
    tokio::time::advance(Duration::from_secs(5)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(pool.get(&key).is_ok());
    assert!(!pool.handler(&key).unwrap().expired());

    tokio::time::advance(Duration::from_secs(6)).await;
    for _ in 0..100 {
        if pool.get(&key).is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(pool.get(&key).is_err());
    assert!(erx.try_recv().is_err());
}

#[tokio::test]
async fn test_streamed_connection_reassembles_split_messages() {
    let (pool, mut mrx, _erx) = pool();
    let (conn, mut peer) = duplex_connection("10.0.0.3:40000");
    pool.put(conn, Duration::ZERO).unwrap();

    let (head, tail) = OPTIONS.split_at(60);
    let mut first = OPTIONS.to_string();
    first.push_str(head);
    peer.write_all(first.as_bytes()).await.unwrap();

    let msg = timeout(WAIT, mrx.recv()).await.unwrap().unwrap();
    assert_eq!(msg.call_id(), Some("3848276298220188511"));
    assert!(mrx.try_recv().is_err());

    peer.write_all(tail.as_bytes()).await.unwrap();
    assert!(timeout(WAIT, mrx.recv()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_udp_round_trip_sets_received_and_rport() {
    init_tracing();

    let server = TransportLayer::new(TransportConfig::default());
    let client = TransportLayer::new(TransportConfig::new("192.0.2.1".parse().unwrap()));
    let mut server_msgs = server.messages().unwrap();
    let mut client_msgs = client.messages().unwrap();

    let server_addr = server
        .listen("udp", "127.0.0.1:0", ListenOptions::default())
        .await
        .unwrap();
    let client_addr = client
        .listen("UDP", "127.0.0.1:0", ListenOptions::default())
        .await
        .unwrap();

    client.send(request("udp", server_addr)).await.unwrap();
    let received = timeout(WAIT, server_msgs.recv()).await.unwrap().unwrap();

    let hop = received.via_hop().unwrap();
    assert_eq!(hop.host, "192.0.2.1");
    assert_eq!(hop.port, Some(client_addr.port()));
    assert_eq!(hop.params.get("received"), Some(Some("127.0.0.1")));
    let rport = client_addr.port().to_string();
    assert_eq!(hop.params.get("rport"), Some(Some(rport.as_str())));
    assert_eq!(received.source(), client_addr.to_string());
    assert_eq!(received.transport(), "UDP");

    server.send(response_to(&received)).await.unwrap();
    let reply = timeout(WAIT, client_msgs.recv()).await.unwrap().unwrap();
    assert!(reply.is_response());
    assert_eq!(reply.source(), server_addr.to_string());

    assert!(!server.is_reliable("udp"));
    assert!(!server.is_streamed("udp"));
}

#[tokio::test]
async fn test_tcp_round_trip_reuses_connection() {
    round_trip("tcp", ListenOptions::default(), TransportConfig::default()).await;
}

#[tokio::test]
async fn test_ws_round_trip() {
    round_trip("ws", ListenOptions::default(), TransportConfig::default()).await;
}

/// Server options with a fresh self-signed certificate, and a client config accepting it.
fn self_signed(name: &str) -> (ListenOptions, TransportConfig) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir().join(format!("sipflow-transport-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    let options = ListenOptions::default().with_tls(TlsServerConfig::new(&cert_path, &key_path));
    let config = TransportConfig::default().with_tls(TlsClientConfig::insecure());
    (options, config)
}

#[tokio::test]
async fn test_tls_round_trip() {
    let (options, config) = self_signed("tls");
    round_trip("tls", options, config).await;
}

#[tokio::test]
async fn test_wss_round_trip() {
    let (options, config) = self_signed("wss");
    round_trip("wss", options, config).await;
}

#[tokio::test]
async fn test_done_with_stalled_handshake() {
    let layer = TransportLayer::new(TransportConfig::default());
    let addr = layer
        .listen("ws", "127.0.0.1:0", ListenOptions::default())
        .await
        .unwrap();

    // never sends the HTTP upgrade
    let mut idle = tokio::net::TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    layer.cancel();
    timeout(WAIT, layer.done()).await.unwrap();
    let _ = idle.shutdown().await;
}

#[tokio::test]
async fn test_request_goes_out_on_message_transport() {
    init_tracing();

    let server = TransportLayer::new(TransportConfig::default());
    let client = TransportLayer::new(TransportConfig::default());
    let mut server_msgs = server.messages().unwrap();

    let addr = server
        .listen("tcp", "127.0.0.1:0", ListenOptions::default())
        .await
        .unwrap();

    let mut msg = request("UDP", addr);
    msg.set_transport("TCP");
    client.send(msg).await.unwrap();

    let received = timeout(WAIT, server_msgs.recv()).await.unwrap().unwrap();
    assert_eq!(received.transport(), "TCP");
    assert_eq!(received.via_hop().unwrap().transport, "TCP");
    assert!(!client.is_reliable("udp"));
    assert!(client.is_reliable("tcp"));
}

#[tokio::test]
async fn test_tls_listen_requires_certificate() {
    let layer = TransportLayer::new(TransportConfig::default());
    let err = layer
        .listen("tls", "127.0.0.1:0", ListenOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Tls(_)));
}

#[tokio::test]
async fn test_unsupported_protocol() {
    let layer = TransportLayer::new(TransportConfig::default());
    let err = layer
        .listen("sctp", "127.0.0.1:0", ListenOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedProtocol(_)));
    assert_eq!(err.to_string(), "protocol sctp is not supported");
}

#[tokio::test]
async fn test_send_failure_is_wrapped() {
    let layer = TransportLayer::new(TransportConfig::default());
    let err = layer
        .send(request("udp", "127.0.0.1:5090".parse().unwrap()))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("send SIP message through udp protocol to 127.0.0.1:5090"));
    assert_eq!(err.kind(), ErrorKind::Pool);
}

#[tokio::test]
async fn test_cancel_and_done() {
    let layer = TransportLayer::new(TransportConfig::default());
    let mut messages = layer.messages().unwrap();
    let mut errors = layer.errors().unwrap();
    assert!(layer.messages().is_none());

    layer
        .listen("udp", "127.0.0.1:0", ListenOptions::default())
        .await
        .unwrap();
    layer
        .listen("tcp", "127.0.0.1:0", ListenOptions::default())
        .await
        .unwrap();

    layer.cancel();
    layer.cancel();
    timeout(WAIT, layer.done()).await.unwrap();

    assert!(messages.recv().await.is_none());
    assert!(errors.recv().await.is_none());

    let err = layer
        .listen("udp", "127.0.0.1:0", ListenOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert!(layer.send(request("udp", "127.0.0.1:5060".parse().unwrap())).await.is_err());
}

#[tokio::test]
async fn test_message_mapper() {
    let server = TransportLayer::new(TransportConfig::default()).with_message_mapper(Arc::new(
        |mut msg: Message| {
            msg.set_destination("mapped");
            msg
        },
    ));
    let client = TransportLayer::new(TransportConfig::default());
    let mut server_msgs = server.messages().unwrap();

    let addr = server
        .listen("tcp", "127.0.0.1:0", ListenOptions::default())
        .await
        .unwrap();
    client.send(request("tcp", addr)).await.unwrap();

    let received = timeout(WAIT, server_msgs.recv()).await.unwrap().unwrap();
    assert_eq!(received.destination(), "mapped");
}
