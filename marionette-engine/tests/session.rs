use marionette_core::Document;
use marionette_engine::{proxy, Dialer, EngineContext, EngineSettings, Error, Listener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(20);

fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new("marionette_engine=debug"))
		.with_test_writer()
		.try_init();
}

fn ctx() -> EngineContext {
	EngineContext::new(EngineSettings {
		keepalive: Duration::from_millis(20),
		redial_delay: Duration::from_millis(10),
		..Default::default()
	})
}

async fn pair(format: &str) -> (Listener, Dialer) {
	init_tracing();
	let ctx = ctx();
	let (_, doc) = ctx.formats.load(&format.parse().unwrap()).unwrap();
	let doc = Arc::new(doc);
	let listener = Listener::bind(ctx.clone(), doc.clone(), "127.0.0.1:0").await.unwrap();
	let dialer = Dialer::connect(ctx, doc, listener.local_addr()).unwrap();
	(listener, dialer)
}

async fn exchange(format: &str) {
	let (listener, dialer) = pair(format).await;
	let client = dialer.dial().unwrap();
	client.write_all(b"foo").await.unwrap();

	let server = timeout(WAIT, listener.accept()).await.expect("accept timed out").unwrap();
	assert_eq!(server.id(), client.id());
	let mut buf = [0u8; 16];
	let n = timeout(WAIT, server.read(&mut buf)).await.unwrap().unwrap();
	assert_eq!(&buf[..n], b"foo", "{format}: upstream");

	server.write_all(b"bar").await.unwrap();
	let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
	assert_eq!(&buf[..n], b"bar", "{format}: downstream");

	dialer.close();
	listener.close();
}

#[tokio::test]
async fn dummy_round_trip() {
	exchange("dummy").await;
}

#[tokio::test]
async fn http_round_trip() {
	exchange("http_simple_blocking").await;
}

#[tokio::test]
async fn http_with_think_time_round_trip() {
	exchange("http_timings").await;
}

#[tokio::test]
async fn ftp_round_trip() {
	exchange("ftp_pasv").await;
}

#[tokio::test]
async fn dns_round_trip() {
	exchange("dns_request").await;
}

#[tokio::test]
async fn spawned_sessions_round_trip() {
	exchange("spawn_http").await;
}

#[tokio::test]
async fn half_close_reaches_the_server() {
	let (listener, dialer) = pair("dummy").await;
	let client = dialer.dial().unwrap();
	client.write_all(b"last words").await.unwrap();
	client.close_write();

	let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
	let mut got = Vec::new();
	let mut buf = [0u8; 16];
	loop {
		let n = timeout(WAIT, server.read(&mut buf)).await.unwrap().unwrap();
		if n == 0 {
			break;
		}
		got.extend_from_slice(&buf[..n]);
	}
	assert_eq!(got, b"last words");
}

#[tokio::test]
async fn bridge_to_tcp_echo() {
	let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let echo_addr = echo.local_addr().unwrap();
	tokio::spawn(async move {
		let (mut sock, _) = echo.accept().await.unwrap();
		let mut buf = [0u8; 64];
		loop {
			let n = sock.read(&mut buf).await.unwrap();
			if n == 0 {
				break;
			}
			sock.write_all(&buf[..n]).await.unwrap();
		}
	});

	let (listener, dialer) = pair("dummy").await;
	let client = dialer.dial().unwrap();
	client.write_all(b"ping").await.unwrap();
	let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
	let upstream = tokio::net::TcpStream::connect(echo_addr).await.unwrap();
	tokio::spawn(proxy::bridge(server, upstream));

	let mut buf = [0u8; 4];
	let mut at = 0;
	while at < 4 {
		at += timeout(WAIT, client.read(&mut buf[at..])).await.unwrap().unwrap();
	}
	assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn closed_listener_stops_accepting() {
	let (listener, dialer) = pair("dummy").await;
	listener.close();
	assert!(matches!(listener.accept().await, Err(Error::ConnectionClosed)));
	dialer.close();
	assert!(dialer.dial().is_err());
}

#[tokio::test]
async fn udp_documents_are_rejected() {
	let doc = Document::from_toml(
		r#"
transport = "udp"
port = 53
[[transitions]]
source = "start"
destination = "end"
action_block = "NULL"
probability = 1.0
"#,
	)
	.unwrap();
	let err = Listener::bind(ctx(), Arc::new(doc), "127.0.0.1:0").await.err().unwrap();
	assert!(matches!(err, Error::Unsupported(_)));
}
