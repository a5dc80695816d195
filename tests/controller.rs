//! Controller tests over an in-memory serial port

use async_trait::async_trait;
use scalelink_core::config::{Mode, ScaleConfig};
use scalelink_core::core::logger::DataLogger;
use scalelink_core::core::protocol::ResponseKind;
use scalelink_core::core::transport::{
    DisconnectReason, DynSerial, EndpointInfo, PortEnumerator, PortOpener, SerialConfig,
    SerialConnection, TransportError,
};
use scalelink_core::{DriverError, DriverEvent, ScaleController, ScaleDriver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

struct DuplexOpener {
    peers: mpsc::UnboundedSender<DuplexStream>,
    refuse: Arc<AtomicBool>,
}

#[async_trait]
impl PortOpener for DuplexOpener {
    async fn open(&self, config: &SerialConfig) -> Result<DynSerial, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Open {
                path: config.port.clone(),
                message: "device unplugged".into(),
            });
        }
        let (ours, theirs) = tokio::io::duplex(1024);
        let _ = self.peers.send(theirs);
        Ok(Box::new(ours))
    }
}

struct FixedPorts(Vec<EndpointInfo>);

impl PortEnumerator for FixedPorts {
    fn list_ports(&self) -> Result<Vec<EndpointInfo>, TransportError> {
        Ok(self.0.clone())
    }
}

fn ftdi_port(path: &str) -> EndpointInfo {
    EndpointInfo {
        vendor_id: Some(0x0403),
        product_id: Some(0x6001),
        manufacturer: Some("FTDI".into()),
        ..EndpointInfo::new(path)
    }
}

fn config() -> Arc<ScaleConfig> {
    let mut config = ScaleConfig::default();
    config.mode = Mode::Scale;
    config.validation.response_timeout_ms = 500;
    config.polling.interval_ms = 500;
    config.validate().unwrap();
    Arc::new(config)
}

fn controller_with(
    config: Arc<ScaleConfig>,
    ports: Vec<EndpointInfo>,
) -> (ScaleController, mpsc::UnboundedReceiver<DuplexStream>, Arc<AtomicBool>) {
    let (peers, rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    let transport = SerialConnection::new(
        config.connection_options(),
        Arc::new(FixedPorts(ports)),
        Arc::new(DuplexOpener {
            peers,
            refuse: refuse.clone(),
        }),
    );
    let scale = ScaleController::with_transport(config, transport, DataLogger::new(true)).unwrap();
    (scale, rx, refuse)
}

fn controller(ports: Vec<EndpointInfo>) -> (ScaleController, mpsc::UnboundedReceiver<DuplexStream>) {
    let (scale, peers, _) = controller_with(config(), ports);
    (scale, peers)
}

async fn connected() -> (ScaleController, DuplexStream) {
    let (scale, mut peers) = controller(vec![ftdi_port("/dev/ttyUSB0")]);
    assert_ok!(scale.connect(Some("/dev/ttyUSB0")).await);
    let peer = peers.recv().await.unwrap();
    (scale, peer)
}

/// Answer each command with `reply`; `None` leaves it unanswered
async fn serve<F>(mut peer: DuplexStream, mut reply: F)
where
    F: FnMut(&[u8; 4]) -> Option<&'static str> + Send + 'static,
{
    let mut cmd = [0u8; 4];
    while peer.read_exact(&mut cmd).await.is_ok() {
        if let Some(line) = reply(&cmd) {
            let framed = format!("{}\r\n", line);
            if peer.write_all(framed.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

async fn next_matching<F>(events: &mut broadcast::Receiver<DriverEvent>, mut pred: F) -> DriverEvent
where
    F: FnMut(&DriverEvent) -> bool,
{
    loop {
        match tokio::time::timeout(Duration::from_secs(60), events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) => continue,
            other => panic!("expected event, got {:?}", other),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_reads_gross_weight() {
    let (scale, peer) = connected().await;
    tokio::spawn(serve(peer, |cmd| match cmd {
        b"SGW\r" => Some("Gross 100.55 lb."),
        b"SCO\r" => Some("Count 157 Pieces"),
        _ => None,
    }));

    let gross = scale.gross_weight().await.unwrap();
    assert_eq!(gross.raw, "Gross 100.55 lb.");
    assert_eq!(gross.parsed.kind, ResponseKind::GrossWeight);
    assert_eq!(gross.parsed.unit.as_deref(), Some("lb"));
    assert_eq!(gross.command, "grossWeight");

    let count = scale.count().await.unwrap();
    assert_eq!(count.parsed.unit.as_deref(), Some("pieces"));

    let stats = scale.stats();
    assert_eq!(stats.stats.commands_sent, 2);
    assert_eq!(stats.stats.responses_received, 2);
    assert!(stats.connection.is_connected);
    assert!(scale.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_succeeds_on_third_attempt() {
    let (scale, peer) = connected().await;
    let mut seen = 0;
    tokio::spawn(serve(peer, move |_| {
        seen += 1;
        (seen >= 3).then_some("Gross 100.55 lb.")
    }));

    let started = Instant::now();
    let response = scale
        .send_command_with_retries("grossWeight", Some(2))
        .await
        .unwrap();

    // two 500ms timeouts plus 100ms and 200ms retry gaps
    assert!(started.elapsed() >= Duration::from_millis(1300));
    assert_eq!(response.raw, "Gross 100.55 lb.");

    let stats = scale.stats().stats;
    assert_eq!(stats.commands_sent, 3);
    assert_eq!(stats.timeouts, 2);
    assert_eq!(stats.responses_received, 1);
    assert_eq!(stats.errors, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let (scale, peer) = connected().await;
    tokio::spawn(serve(peer, |_| None));

    let err = scale
        .send_command_with_retries("netWeight", Some(1))
        .await
        .unwrap_err();

    match &err {
        DriverError::RetriesExhausted { command, attempts, .. } => {
            assert_eq!(command, "netWeight");
            assert_eq!(*attempts, 2);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(matches!(err.root(), DriverError::CommandTimeout { attempt: 2, .. }));
    assert!(scale.pending_command().is_none());

    let stats = scale.stats().stats;
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.timeouts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejects_before_writing() {
    let (scale, _peers) = controller(Vec::new());
    let err = assert_err!(scale.gross_weight().await);
    assert!(matches!(err, DriverError::Transport(TransportError::NotConnected)));

    let (scale, _peer) = connected().await;
    let err = scale.send_command("bogus").await.unwrap_err();
    assert!(matches!(err, DriverError::UnknownCommand(ref name) if name == "bogus"));
    assert_eq!(scale.stats().stats.commands_sent, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_line_is_reported() {
    let (scale, mut peer) = connected().await;
    let mut events = scale.subscribe();

    peer.write_all(b"Gross 5.00 lb.\r\n").await.unwrap();

    let event = next_matching(&mut events, |e| matches!(e, DriverEvent::Response { .. })).await;
    match event {
        DriverEvent::Response { parsed, command } => {
            assert_eq!(parsed.raw, "Gross 5.00 lb.");
            assert!(command.is_none());
        }
        _ => unreachable!(),
    }
    assert_eq!(scale.stats().stats.responses_received, 0);
}

#[tokio::test(start_paused = true)]
async fn test_auto_detects_ftdi_port() {
    let (scale, mut peers) = controller(vec![
        EndpointInfo::new("/dev/ttyS0"),
        ftdi_port("/dev/ttyUSB3"),
    ]);
    let mut events = scale.subscribe();

    scale.connect(None).await.unwrap();
    assert!(peers.recv().await.is_some());

    let event = next_matching(&mut events, |e| matches!(e, DriverEvent::Connected { .. })).await;
    assert!(matches!(event, DriverEvent::Connected { ref path, .. } if path == "/dev/ttyUSB3"));
    assert_eq!(scale.stats().connection.path.as_deref(), Some("/dev/ttyUSB3"));
}

#[tokio::test(start_paused = true)]
async fn test_auto_detect_without_ftdi_fails() {
    let (scale, _peers) = controller(vec![EndpointInfo::new("/dev/ttyS0")]);
    let err = assert_err!(scale.connect(None).await);
    assert!(matches!(err, DriverError::Transport(TransportError::NoDeviceFound)));
}

#[tokio::test(start_paused = true)]
async fn test_polling_restart_keeps_one_command_in_flight() {
    let (scale, peer) = connected().await;
    tokio::spawn(serve(peer, |_| Some("Gross 1.00 lb.")));
    let mut events = scale.subscribe();

    scale.start_polling("grossWeight");
    next_matching(&mut events, |e| matches!(e, DriverEvent::Reading(_))).await;
    scale.stop_polling();
    assert!(!scale.is_polling());

    scale.start_polling("grossWeight");
    scale.start_polling("grossWeight");
    assert!(scale.is_polling());

    // cycles at 0, 500 and 1000ms after the restart
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let stats = scale.stats();
    assert_eq!(stats.stats.commands_sent, 3);
    assert_eq!(stats.stats.responses_received, 3);
    assert_eq!(stats.packet_loss, 0.0);
    assert!(stats.is_polling);
    assert!(scale.pending_command().is_none());

    scale.stop_polling();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(scale.stats().stats.commands_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_stops_polling_and_reconnects() {
    let (scale, mut peers) = controller(vec![ftdi_port("/dev/ttyUSB0")]);
    scale.connect(Some("/dev/ttyUSB0")).await.unwrap();
    let mut peer = peers.recv().await.unwrap();
    let mut events = scale.subscribe();

    scale.start_polling("grossWeight");
    let mut cmd = [0u8; 4];
    peer.read_exact(&mut cmd).await.unwrap();
    assert_eq!(&cmd, b"SGW\r");
    peer.write_all(b"Gross 2.00 lb.\r\n").await.unwrap();
    next_matching(&mut events, |e| matches!(e, DriverEvent::Reading(_))).await;

    drop(peer);

    let event = next_matching(&mut events, |e| matches!(e, DriverEvent::Disconnected(_))).await;
    assert!(matches!(event, DriverEvent::Disconnected(DisconnectReason::RemoteClosed)));
    assert!(!scale.is_polling());

    let event = next_matching(&mut events, |e| matches!(e, DriverEvent::Reconnecting { .. })).await;
    assert!(matches!(
        event,
        DriverEvent::Reconnecting { attempt: 1, delay, .. } if delay == Duration::from_secs(1)
    ));
    next_matching(&mut events, |e| matches!(e, DriverEvent::Connected { .. })).await;
    assert!(scale.is_connected());
    assert!(peers.recv().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_user_disconnect_does_not_reconnect() {
    let (scale, _peer) = connected().await;
    let mut events = scale.subscribe();

    scale.disconnect().await;
    let event = next_matching(&mut events, |e| matches!(e, DriverEvent::Disconnected(_))).await;
    assert!(matches!(event, DriverEvent::Disconnected(DisconnectReason::User)));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!scale.is_connected());
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_link_lost_mid_command_reports_attempts() {
    let (scale, mut peer) = connected().await;

    let request = {
        let scale = scale.clone();
        tokio::spawn(async move { scale.send_command_with_retries("grossWeight", Some(3)).await })
    };

    let mut cmd = [0u8; 4];
    peer.read_exact(&mut cmd).await.unwrap();
    assert_eq!(&cmd, b"SGW\r");
    drop(peer);

    let err = assert_err!(request.await.unwrap());
    match &err {
        DriverError::RetriesExhausted { command, attempts, .. } => {
            assert_eq!(command, "grossWeight");
            assert_eq!(*attempts, 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(matches!(
        err.root(),
        DriverError::Transport(TransportError::NotConnected)
    ));

    // only the attempt that reached the wire is counted
    let stats = scale.stats().stats;
    assert_eq!(stats.commands_sent, 1);
    assert_eq!(stats.responses_received, 0);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.timeouts, 0);
    assert!(scale.pending_command().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_polling_releases_unanswered_command() {
    let (scale, mut peer) = connected().await;
    let mut events = scale.subscribe();
    let mut cmd = [0u8; 4];

    scale.start_polling("grossWeight");
    peer.read_exact(&mut cmd).await.unwrap();
    assert_eq!(
        scale.pending_command().map(|p| p.name),
        Some("grossWeight".to_string())
    );

    scale.stop_polling();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(scale.pending_command().is_none());

    scale.start_polling("grossWeight");
    peer.read_exact(&mut cmd).await.unwrap();
    assert_eq!(&cmd, b"SGW\r");
    peer.write_all(b"Gross 3.00 lb.\r\n").await.unwrap();

    let event = next_matching(&mut events, |e| matches!(e, DriverEvent::Reading(_))).await;
    assert!(matches!(event, DriverEvent::Reading(ref r) if r.raw == "Gross 3.00 lb."));
    scale.stop_polling();

    let stats = scale.stats().stats;
    assert_eq!(stats.commands_sent, 1);
    assert_eq!(stats.responses_received, 1);
    assert!(scale.pending_command().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_commands_after_exhaustion_report_it() {
    let mut config = (*config()).clone();
    config.reconnect.max_attempts = 2;
    let (scale, mut peers, refuse) = controller_with(Arc::new(config), vec![ftdi_port("/dev/ttyUSB0")]);
    let mut events = scale.subscribe();

    assert_ok!(scale.connect(Some("/dev/ttyUSB0")).await);
    let peer = peers.recv().await.unwrap();
    refuse.store(true, Ordering::SeqCst);
    drop(peer);

    let event =
        next_matching(&mut events, |e| matches!(e, DriverEvent::ReconnectExhausted { .. })).await;
    assert!(matches!(event, DriverEvent::ReconnectExhausted { attempts: 2 }));

    let err = assert_err!(scale.gross_weight().await);
    assert!(matches!(
        err,
        DriverError::Transport(TransportError::ReconnectExhausted { attempts: 2 })
    ));
    assert_eq!(scale.stats().stats.commands_sent, 0);
}
