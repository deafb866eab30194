//! Sessions over real sockets against a minimal loopback gateway

mod common;

use common::{init_tracing, wait_event, WAIT};
use dispatch_sip::infrastructure::protocols::sip::builder::ResponseBuilder;
use dispatch_sip::infrastructure::protocols::sip::{Field, MessageType, SipMessage, StreamDecoder};
use dispatch_sip::{SessionConfig, SessionEvent, SessionState, SipSession, TransportKind};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn respond(request: &SipMessage, code: u16) -> SipMessage {
    ResponseBuilder::new(code).to_tag("gw").build_for_request(request)
}

fn ping(seq: u32) -> SipMessage {
    let mut msg = SipMessage::request(MessageType::Options, "sip:1007@127.0.0.1");
    msg.set_cseq(seq, MessageType::Options);
    msg.set_field(Field::Via, "SIP/2.0/UDP 127.0.0.1;branch=z9hG4bKping");
    msg.set_field(Field::From, "<sip:gw@127.0.0.1>;tag=gw");
    msg.set_field(Field::To, "<sip:1007@127.0.0.1>");
    msg.set_field(Field::CallId, format!("ping-{}", seq));
    msg
}

async fn read_message(stream: &mut TcpStream, decoder: &mut StreamDecoder) -> SipMessage {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(result) = decoder.next_message() {
            return result.expect("well-formed message");
        }
        let n = timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("read in time")
            .expect("read");
        assert!(n > 0, "session closed the connection");
        decoder.push(&buf[..n]);
    }
}

async fn recv_datagram(socket: &UdpSocket) -> (SipMessage, std::net::SocketAddr) {
    let mut buf = vec![0u8; 65536];
    let (n, from) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("datagram in time")
        .expect("recv_from");
    (SipMessage::decode(&buf[..n]).expect("well-formed datagram"), from)
}

#[tokio::test]
async fn test_tcp_register_ping_and_unregister() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = SessionConfig::new("1007", "pass", "127.0.0.1", port).with_transport(TransportKind::Tcp);
    let (tx, mut events) = mpsc::unbounded_channel::<SessionEvent>();
    let session = SipSession::new(config, Arc::new(tx)).unwrap();
    session.start().unwrap();

    let (mut stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut decoder = StreamDecoder::new();

    let register = read_message(&mut stream, &mut decoder).await;
    assert_eq!(register.kind(), MessageType::Register);
    assert!(register.field(&Field::Via).unwrap().starts_with("SIP/2.0/TCP 127.0.0.1:"));
    assert!(register.field(&Field::Contact).unwrap().contains(";transport=tcp"));
    stream.write_all(&respond(&register, 200).encode()).await.unwrap();
    wait_event(&mut events, |e| matches!(e, SessionEvent::Registered)).await;
    assert!(session.local_addr().is_some());

    stream.write_all(&ping(2).encode()).await.unwrap();
    let pong = read_message(&mut stream, &mut decoder).await;
    assert_eq!(pong.status(), Some(200));
    assert_eq!(pong.field(&Field::CallId), Some("ping-2"));

    let gateway = async {
        let unregister = read_message(&mut stream, &mut decoder).await;
        assert_eq!(unregister.number(&Field::Expires), Some(0));
        stream.write_all(&respond(&unregister, 200).encode()).await.unwrap();
    };
    tokio::join!(session.shutdown(), gateway);
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_tcp_reconnects_after_gateway_drops() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = SessionConfig::new("1007", "pass", "127.0.0.1", port);
    config.timing.reconnect_pause = std::time::Duration::from_millis(100);
    let (tx, mut events) = mpsc::unbounded_channel::<SessionEvent>();
    let session = SipSession::new(config, Arc::new(tx)).unwrap();
    session.start().unwrap();

    let (mut first, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut decoder = StreamDecoder::new();
    let register = read_message(&mut first, &mut decoder).await;
    first.write_all(&respond(&register, 200).encode()).await.unwrap();
    wait_event(&mut events, |e| matches!(e, SessionEvent::Registered)).await;

    drop(first);
    wait_event(&mut events, |e| matches!(e, SessionEvent::ServerUnregistered)).await;

    let (mut second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut decoder = StreamDecoder::new();
    let register = read_message(&mut second, &mut decoder).await;
    assert_eq!(register.kind(), MessageType::Register);
    second.write_all(&respond(&register, 200).encode()).await.unwrap();
    wait_event(&mut events, |e| matches!(e, SessionEvent::Registered)).await;

    let gateway = async {
        let unregister = read_message(&mut second, &mut decoder).await;
        second.write_all(&respond(&unregister, 200).encode()).await.unwrap();
    };
    tokio::join!(session.shutdown(), gateway);
}

#[tokio::test]
async fn test_udp_register_and_ping_reply_to_source() {
    init_tracing();
    let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = gateway.local_addr().unwrap().port();

    let config = SessionConfig::new("1007", "pass", "127.0.0.1", port).with_transport(TransportKind::Udp);
    let (tx, mut events) = mpsc::unbounded_channel::<SessionEvent>();
    let session = SipSession::new(config, Arc::new(tx)).unwrap();
    session.start().unwrap();

    let (register, client) = recv_datagram(&gateway).await;
    assert_eq!(register.kind(), MessageType::Register);
    assert!(register.field(&Field::Via).unwrap().starts_with("SIP/2.0/UDP 127.0.0.1:"));
    gateway
        .send_to(&respond(&register, 200).encode(), client)
        .await
        .unwrap();
    wait_event(&mut events, |e| matches!(e, SessionEvent::Registered)).await;

    gateway.send_to(&ping(5).encode(), client).await.unwrap();
    let (pong, from) = recv_datagram(&gateway).await;
    assert_eq!(from, client);
    assert_eq!(pong.status(), Some(200));
    assert_eq!(pong.seq(), Some(5));

    let answer_unregister = async {
        let (unregister, client) = recv_datagram(&gateway).await;
        assert_eq!(unregister.number(&Field::Expires), Some(0));
        gateway
            .send_to(&respond(&unregister, 200).encode(), client)
            .await
            .unwrap();
    };
    tokio::join!(session.shutdown(), answer_unregister);
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_invalid_server_address_is_rejected() {
    let config = SessionConfig::new("1007", "pass", "bad host", 5060);
    let (tx, _events) = mpsc::unbounded_channel::<SessionEvent>();
    assert!(SipSession::new(config, Arc::new(tx)).is_err());

    let config = SessionConfig::new("", "pass", "127.0.0.1", 5060);
    let (tx, _events) = mpsc::unbounded_channel::<SessionEvent>();
    assert!(SipSession::new(config, Arc::new(tx)).is_err());
}
