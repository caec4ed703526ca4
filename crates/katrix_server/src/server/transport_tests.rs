#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use katrix_protocol::{DEFAULT_MAX_FRAME_SIZE, IpcMessage, MultipartAssembler, encode_multipart, encode_part_into, pb};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::TransportSettings;
use crate::server::request::{Outcome, normalize};
use crate::server::transport::{Mailbox, TransportServer, decode_inbound};

fn free_port() -> u16 {
	let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
	l.local_addr().expect("addr").port()
}

fn settings(tx_port: u16) -> TransportSettings {
	TransportSettings {
		rx_bind: format!("tcp://127.0.0.1:{}", free_port()),
		tx_connect: format!("tcp://127.0.0.1:{tx_port}"),
		reconnect_min_delay: Duration::from_millis(10),
		reconnect_max_delay: Duration::from_millis(50),
		..TransportSettings::default()
	}
}

fn command(id: &str) -> IpcMessage {
	IpcMessage::Platform(pb::PlatformMessage {
		platform: "kiq".to_string(),
		id: id.to_string(),
		user: "operator".to_string(),
		content: format!("payload {id}"),
		..Default::default()
	})
}

fn wire(identity: &[u8], msg: &IpcMessage) -> Vec<u8> {
	let mut frames = vec![Bytes::copy_from_slice(identity)];
	frames.extend(msg.to_frames());
	encode_multipart(&frames, DEFAULT_MAX_FRAME_SIZE).expect("encode").to_vec()
}

async fn read_message(stream: &mut TcpStream) -> Vec<Bytes> {
	let mut asm = MultipartAssembler::new(DEFAULT_MAX_FRAME_SIZE);
	let mut buf = [0u8; 4096];
	loop {
		if let Some(frames) = asm.next_message().expect("framing") {
			return frames;
		}
		let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
			.await
			.expect("read timed out")
			.expect("read");
		assert!(n > 0, "peer closed before a full message arrived");
		asm.extend(&buf[..n]);
	}
}

async fn next_msg(server: &TransportServer) -> IpcMessage {
	timeout(Duration::from_secs(5), async {
		loop {
			if let Some(msg) = server.get_msg() {
				return msg;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("inbound message")
}

#[tokio::test]
async fn duplicate_commands_are_dropped_and_replies_echo_the_original() {
	let peer = TcpListener::bind("127.0.0.1:0").await.expect("peer bind");
	let server = TransportServer::start(&settings(peer.local_addr().expect("addr").port()), "matrix")
		.await
		.expect("start");
	let (mut peer_stream, _) = timeout(Duration::from_secs(5), peer.accept())
		.await
		.expect("outbound connect")
		.expect("accept");

	let mut producer = TcpStream::connect(server.local_addr()).await.expect("connect");
	let query = IpcMessage::Info(pb::PlatformInfo {
		platform: "kiq".to_string(),
		info: String::new(),
		kind: "rooms".to_string(),
	});
	producer.write_all(&wire(b"kiq", &command("1"))).await.expect("write");
	producer.write_all(&wire(b"kiq", &command("1"))).await.expect("write");
	producer.write_all(&wire(b"kiq", &query)).await.expect("write");

	let first = next_msg(&server).await;
	assert_eq!(first, command("1"));
	assert_eq!(next_msg(&server).await, query);
	assert!(!server.has_msgs());
	assert_eq!(server.pending_replies(), 2);

	let req = normalize(&first).expect("request");
	server.reply(&req, Outcome::Success);
	server.flush().await;

	let frames = read_message(&mut peer_stream).await;
	let (identity, echoed) = decode_inbound(&frames).expect("decode reply");
	assert_eq!(&identity[..], b"katrix_daemon");
	assert_eq!(echoed, command("1"));
	assert_eq!(server.pending_replies(), 1);

	server.shutdown().await;
}

#[tokio::test]
async fn undecodable_messages_are_dropped() {
	let peer = TcpListener::bind("127.0.0.1:0").await.expect("peer bind");
	let server = TransportServer::start(&settings(peer.local_addr().expect("addr").port()), "matrix")
		.await
		.expect("start");

	let mut producer = TcpStream::connect(server.local_addr()).await.expect("connect");
	producer.write_all(&wire(b"", &command("bad"))).await.expect("write");
	let unknown_kind = encode_multipart(&[&b"kiq"[..], &[42u8][..], &b""[..]], DEFAULT_MAX_FRAME_SIZE).expect("encode");
	producer.write_all(&unknown_kind).await.expect("write");
	producer.write_all(&wire(b"kiq", &command("good"))).await.expect("write");

	assert_eq!(next_msg(&server).await, command("good"));
	assert!(server.get_msg().is_none());

	server.shutdown().await;
}

#[tokio::test]
async fn replies_wait_for_the_outbound_peer() {
	let tx_port = free_port();
	let server = TransportServer::start(&settings(tx_port), "matrix").await.expect("start");
	assert!(!server.is_outbound_connected());

	let mut producer = TcpStream::connect(server.local_addr()).await.expect("connect");
	producer.write_all(&wire(b"kiq", &command("late"))).await.expect("write");
	let req = normalize(&next_msg(&server).await).expect("request");
	server.reply(&req, Outcome::failure("room is gone"));

	let peer = TcpListener::bind(("127.0.0.1", tx_port)).await.expect("peer bind");
	let (mut peer_stream, _) = timeout(Duration::from_secs(5), peer.accept())
		.await
		.expect("outbound connect")
		.expect("accept");

	let frames = read_message(&mut peer_stream).await;
	let (_, reply) = decode_inbound(&frames).expect("decode");
	assert_eq!(reply, IpcMessage::fail("matrix", "late", "room is gone"));

	server.shutdown().await;
}

#[tokio::test]
async fn endless_multipart_closes_only_that_connection() {
	let peer = TcpListener::bind("127.0.0.1:0").await.expect("peer bind");
	let mut cfg = settings(peer.local_addr().expect("addr").port());
	cfg.max_message_parts = 4;
	let server = TransportServer::start(&cfg, "matrix").await.expect("start");

	let mut flood = TcpStream::connect(server.local_addr()).await.expect("connect");
	let mut parts = BytesMut::new();
	for _ in 0..16 {
		encode_part_into(&mut parts, &[0u8; 64], true, DEFAULT_MAX_FRAME_SIZE).expect("encode");
	}
	flood.write_all(&parts).await.expect("write");

	let mut buf = [0u8; 16];
	let read = timeout(Duration::from_secs(5), flood.read(&mut buf))
		.await
		.expect("connection closed");
	assert!(matches!(read, Ok(0) | Err(_)), "server kept the flooding connection open");

	let mut producer = TcpStream::connect(server.local_addr()).await.expect("connect");
	producer.write_all(&wire(b"kiq", &command("after"))).await.expect("write");
	assert_eq!(next_msg(&server).await, command("after"));
	assert!(!server.has_msgs());

	server.shutdown().await;
}

#[test]
fn decode_inbound_requires_identity_and_body() {
	assert!(decode_inbound(&[]).is_err());
	assert!(decode_inbound(&[Bytes::new()]).is_err());
	assert!(decode_inbound(&[Bytes::from_static(b"kiq")]).is_err());

	let mut frames = vec![Bytes::from_static(b"kiq")];
	frames.extend(command("9").to_frames());
	let (identity, msg) = decode_inbound(&frames).expect("decode");
	assert_eq!(&identity[..], b"kiq");
	assert_eq!(msg, command("9"));
}
