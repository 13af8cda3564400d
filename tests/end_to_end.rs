use async_trait::async_trait;
use buttoncast::button::{EdgeKind, PinLevel, VirtualPin};
use buttoncast::config::Config;
use buttoncast::process::{ProcessError, ProcessTerminator};
use buttoncast::supervisor::{ShutdownReason, Supervisor, SupervisorHandle};
use futures::{SinkExt, StreamExt};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct RecordingTerminator {
    calls: AtomicUsize,
}

#[async_trait]
impl ProcessTerminator for RecordingTerminator {
    async fn terminate(&self) -> Result<(), ProcessError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn target(&self) -> &str {
        "chromium-browser"
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.server.bind_address = Ipv4Addr::LOCALHOST.into();
    config.server.port = 0;
    config.server.send_timeout_ms = 200;
    config.shutdown.grace_period_ms = 1000;
    config
}

async fn start(pin: &VirtualPin) -> (SupervisorHandle, Arc<RecordingTerminator>) {
    let terminator = Arc::new(RecordingTerminator::default());
    let handle = Supervisor::start(&config(), Box::new(pin.clone()), terminator.clone())
        .await
        .unwrap();
    (handle, terminator)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    // Registration happens right after the handshake on the server side.
    sleep(Duration::from_millis(50)).await;
    client
}

/// Next text frame, or `None` if nothing arrives within `wait`.
async fn next_text(client: &mut Client, wait: Duration) -> Option<String> {
    loop {
        match timeout(wait, client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text.as_str().to_string()),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn press_is_broadcast_once_to_every_client() {
    let pin = VirtualPin::new(PinLevel::Released);
    let (handle, _) = start(&pin).await;

    let mut first = connect(handle.local_addr()).await;
    let mut second = connect(handle.local_addr()).await;

    // Rest, then a 200ms press.
    sleep(Duration::from_millis(300)).await;
    let pressed_at = Instant::now();
    pin.set(PinLevel::Asserted);

    let down = next_text(&mut first, Duration::from_secs(2)).await;
    let latency = pressed_at.elapsed();
    assert_eq!(down.as_deref(), Some("DOWN"));
    assert!(latency >= Duration::from_millis(30), "too early: {:?}", latency);
    assert!(latency < Duration::from_millis(500), "too late: {:?}", latency);
    assert_eq!(
        next_text(&mut second, Duration::from_secs(2)).await.as_deref(),
        Some("DOWN")
    );

    sleep(Duration::from_millis(200)).await;
    pin.set(PinLevel::Released);

    // Release is not transmitted.
    assert_eq!(next_text(&mut first, Duration::from_millis(300)).await, None);

    let _ = handle
        .shutdown_trigger()
        .trigger(ShutdownReason::Requested);
    let report = handle.wait().await.unwrap();
    assert_eq!(report.presses_broadcast, 1);
    assert!(report.pin_released);
    assert_eq!(pin.release_count(), 1);
}

#[tokio::test]
async fn contact_bounce_yields_a_single_down() {
    let pin = VirtualPin::new(PinLevel::Released);
    let (handle, _) = start(&pin).await;
    let mut client = connect(handle.local_addr()).await;

    for _ in 0..5 {
        pin.set(PinLevel::Asserted);
        sleep(Duration::from_millis(3)).await;
        pin.set(PinLevel::Released);
        sleep(Duration::from_millis(3)).await;
    }
    pin.set(PinLevel::Asserted);

    assert_eq!(
        next_text(&mut client, Duration::from_secs(2)).await.as_deref(),
        Some("DOWN")
    );
    assert_eq!(next_text(&mut client, Duration::from_millis(300)).await, None);

    let _ = handle
        .shutdown_trigger()
        .trigger(ShutdownReason::Requested);
    let report = handle.wait().await.unwrap();
    assert_eq!(report.presses_broadcast, 1);
}

#[tokio::test]
async fn exit_stops_browser_and_server() {
    let pin = VirtualPin::new(PinLevel::Released);
    let (handle, terminator) = start(&pin).await;
    let addr = handle.local_addr();

    let mut client = connect(addr).await;
    client.send(Message::text("EXIT".to_string())).await.unwrap();

    let report = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("shutdown within the grace period")
        .unwrap();

    assert!(matches!(report.reason, ShutdownReason::ExitCommand { .. }));
    assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);
    assert!(report.listener_closed);
    assert!(report.pin_released);
    assert_eq!(pin.release_count(), 1);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn disconnected_client_does_not_affect_others() {
    let pin = VirtualPin::new(PinLevel::Released);
    let (handle, _) = start(&pin).await;

    let gone = connect(handle.local_addr()).await;
    let mut stays = connect(handle.local_addr()).await;
    drop(gone);
    sleep(Duration::from_millis(50)).await;

    pin.set(PinLevel::Asserted);
    assert_eq!(
        next_text(&mut stays, Duration::from_secs(2)).await.as_deref(),
        Some("DOWN")
    );

    let _ = handle
        .shutdown_trigger()
        .trigger(ShutdownReason::Requested);
    let report = handle.wait().await.unwrap();
    assert!(report.connections_closed);
}

#[tokio::test]
async fn subscribers_see_presses_and_releases() {
    let pin = VirtualPin::new(PinLevel::Released);
    let (handle, _) = start(&pin).await;
    let mut edges = handle.subscribe();

    pin.set(PinLevel::Asserted);
    sleep(Duration::from_millis(100)).await;
    pin.set(PinLevel::Released);

    let press = timeout(Duration::from_secs(2), edges.recv()).await.unwrap().unwrap();
    let release = timeout(Duration::from_secs(2), edges.recv()).await.unwrap().unwrap();
    assert_eq!(press.kind, EdgeKind::PressStart);
    assert_eq!(release.kind, EdgeKind::Release);
    assert!(release.detected_at > press.detected_at);

    let _ = handle
        .shutdown_trigger()
        .trigger(ShutdownReason::Requested);
    let report = handle.wait().await.unwrap();
    assert_eq!(report.presses_broadcast, 1);
}
