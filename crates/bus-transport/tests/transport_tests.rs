use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bus_transport::{
    Bus, BusTransport, Connector, SerialConfig, SerialConnector, TransportConfig, TransportError,
};
use kaco_protocol::{CodecError, Command, QueryFrame, ResponseBody};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use types::{DeviceAddress, FailureKind};

const STANDARD_FRAME: &[u8] =
    b"\n*030   4 486.8  1.29   627 236.0  2.43   558  24   3401 \x92 3600xi\r";
const TIMEOUT: Duration = Duration::from_millis(500);

struct ScriptedConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    fn new(streams: Vec<DuplexStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.streams
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no device"))
    }

    fn describe(&self) -> String {
        "duplex".to_string()
    }
}

fn quick_config() -> TransportConfig {
    TransportConfig {
        min_quiet: Duration::ZERO,
        reconnect_backoff: Duration::from_secs(10),
        reconnect_max_backoff: Duration::from_secs(60),
    }
}

fn single_link(config: TransportConfig) -> (BusTransport<ScriptedConnector>, DuplexStream) {
    let (client, device) = duplex(512);
    (
        BusTransport::new(ScriptedConnector::new(vec![client]), config),
        device,
    )
}

fn query(address: u8, command: Command) -> QueryFrame {
    QueryFrame::new(DeviceAddress::new(address).expect("address"), command)
}

async fn read_query(device: &mut DuplexStream) -> Vec<u8> {
    let mut query = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        device.read_exact(&mut byte).await.expect("read query");
        query.push(byte[0]);
        if byte[0] == b'\r' {
            return query;
        }
    }
}

#[tokio::test]
async fn request_decodes_reply_from_device() {
    let (transport, mut device) = single_link(quick_config());
    let inverter = tokio::spawn(async move {
        let received = read_query(&mut device).await;
        device.write_all(STANDARD_FRAME).await.expect("reply");
        (received, device)
    });

    let frame = transport
        .request(&query(3, Command::Readings), TIMEOUT)
        .await
        .expect("request");
    let (received, _device) = inverter.await.expect("inverter");

    assert_eq!(received, b"#030\r");
    assert_eq!(frame.address.get(), 3);
    let ResponseBody::Readings { telemetry, .. } = frame.body else {
        panic!("expected readings");
    };
    assert_eq!(telemetry.power_w(), 558.0);
    assert!(transport.is_connected().await);
}

#[tokio::test]
async fn reply_with_carriage_return_checksum_is_read_to_the_end() {
    let (transport, mut device) = single_link(quick_config());
    let inverter = tokio::spawn(async move {
        read_query(&mut device).await;
        device
            .write_all(b"\n*420   4 699.9 999.99 999999 999.1 123.45   1558 42   13401 \r")
            .await
            .expect("head");
        tokio::time::sleep(Duration::from_millis(30)).await;
        device
            .write_all(b" 100kTR 123456789\r")
            .await
            .expect("tail");
        device
    });

    let frame = transport
        .request(&query(42, Command::Readings), TIMEOUT)
        .await
        .expect("request");
    let _device = inverter.await.expect("inverter");

    let ResponseBody::Readings { telemetry, .. } = frame.body else {
        panic!("expected readings");
    };
    assert_eq!(telemetry.inverter_type, "100kTR");
    assert_eq!(telemetry.total_yield_kwh, Some(123_456_789.0));
}

#[tokio::test]
async fn silent_device_times_out() {
    let (transport, mut device) = single_link(quick_config());
    let inverter = tokio::spawn(async move {
        read_query(&mut device).await;
        device
    });

    let err = transport
        .request(&query(3, Command::Readings), Duration::from_millis(50))
        .await
        .expect_err("timeout");
    let _device = inverter.await.expect("inverter");

    assert!(matches!(err, TransportError::Timeout { timeout_ms: 50 }));
    assert_eq!(err.failure_kind(), FailureKind::Timeout);
    assert!(transport.is_connected().await);
}

#[tokio::test]
async fn partial_reply_is_too_short() {
    let (transport, mut device) = single_link(quick_config());
    let inverter = tokio::spawn(async move {
        read_query(&mut device).await;
        device
            .write_all(&STANDARD_FRAME[..30])
            .await
            .expect("partial");
        device
    });

    let err = transport
        .request(&query(3, Command::Readings), Duration::from_millis(50))
        .await
        .expect_err("partial");
    let _device = inverter.await.expect("inverter");

    assert!(matches!(
        err,
        TransportError::Codec(CodecError::FrameTooShort)
    ));
}

#[tokio::test]
async fn echoed_query_is_skipped() {
    let (transport, mut device) = single_link(quick_config());
    let inverter = tokio::spawn(async move {
        let received = read_query(&mut device).await;
        device.write_all(&received).await.expect("echo");
        device.write_all(STANDARD_FRAME).await.expect("reply");
        device
    });

    let frame = transport
        .request(&query(3, Command::Readings), TIMEOUT)
        .await
        .expect("request");
    let _device = inverter.await.expect("inverter");
    assert_eq!(frame.command, Command::Readings);
}

#[tokio::test]
async fn reply_from_another_address_is_rejected() {
    let (transport, mut device) = single_link(quick_config());
    let inverter = tokio::spawn(async move {
        read_query(&mut device).await;
        device.write_all(STANDARD_FRAME).await.expect("reply");
        device
    });

    let err = transport
        .request(&query(5, Command::Readings), TIMEOUT)
        .await
        .expect_err("wrong address");
    let _device = inverter.await.expect("inverter");

    assert!(matches!(err, TransportError::UnexpectedAddress { .. }));
    assert_eq!(err.failure_kind(), FailureKind::UnexpectedResponse);
}

#[tokio::test]
async fn corrupted_reply_reports_checksum_mismatch() {
    let (transport, mut device) = single_link(quick_config());
    let inverter = tokio::spawn(async move {
        read_query(&mut device).await;
        let mut corrupted = STANDARD_FRAME.to_vec();
        corrupted[12] ^= 0x01;
        device.write_all(&corrupted).await.expect("reply");
        device
    });

    let err = transport
        .request(&query(3, Command::Readings), TIMEOUT)
        .await
        .expect_err("corrupted");
    let _device = inverter.await.expect("inverter");

    assert_eq!(err.failure_kind(), FailureKind::ChecksumMismatch);
    assert!(!err.is_bus_error());
}

#[tokio::test]
async fn closed_link_is_dropped_and_reopened() {
    let (first, mut first_device) = duplex(512);
    let (second, mut second_device) = duplex(512);
    let transport = BusTransport::new(
        ScriptedConnector::new(vec![first, second]),
        quick_config(),
    );

    let hangup = tokio::spawn(async move {
        read_query(&mut first_device).await;
    });
    let err = transport
        .request(&query(3, Command::Readings), TIMEOUT)
        .await
        .expect_err("closed link");
    hangup.await.expect("hangup");

    assert!(err.is_bus_error());
    assert_eq!(err.failure_kind(), FailureKind::BusError);
    assert!(!transport.is_connected().await);

    let inverter = tokio::spawn(async move {
        read_query(&mut second_device).await;
        second_device
            .write_all(STANDARD_FRAME)
            .await
            .expect("reply");
        second_device
    });
    transport
        .request(&query(3, Command::Readings), TIMEOUT)
        .await
        .expect("reopened link");
    let _device = inverter.await.expect("inverter");
    assert!(transport.is_connected().await);
}

#[tokio::test]
async fn failed_connect_backs_off() {
    let connector = ScriptedConnector::new(Vec::new());
    let transport = BusTransport::new(connector, quick_config());

    let first = transport
        .request(&query(3, Command::Readings), TIMEOUT)
        .await
        .expect_err("no device");
    assert!(matches!(first, TransportError::Bus(_)));

    let second = transport
        .request(&query(3, Command::Readings), TIMEOUT)
        .await
        .expect_err("backing off");
    assert!(matches!(second, TransportError::Offline { retry_in_ms } if retry_in_ms > 0));
    assert!(second.is_bus_error());
}

#[tokio::test]
async fn quiet_time_separates_transmissions() {
    let mut config = quick_config();
    config.min_quiet = Duration::from_millis(100);
    let (transport, mut device) = single_link(config);

    let inverter = tokio::spawn(async move {
        read_query(&mut device).await;
        device.write_all(STANDARD_FRAME).await.expect("reply");
        let replied_at = Instant::now();
        read_query(&mut device).await;
        let gap = replied_at.elapsed();
        device.write_all(STANDARD_FRAME).await.expect("reply");
        (gap, device)
    });

    for _ in 0..2 {
        transport
            .request(&query(3, Command::Readings), TIMEOUT)
            .await
            .expect("request");
    }
    let (gap, _device) = inverter.await.expect("inverter");
    assert!(gap >= Duration::from_millis(100), "gap was {gap:?}");
}

#[tokio::test]
async fn encoding_error_never_touches_the_link() {
    let connector = ScriptedConnector::new(Vec::new());
    let transport = BusTransport::new(connector, quick_config());

    let mut bad = query(3, Command::Readings);
    bad.payload = vec![0x07];
    let err = transport.request(&bad, TIMEOUT).await.expect_err("encoding");

    assert_eq!(err.failure_kind(), FailureKind::Encoding);
    assert!(!transport.is_connected().await);
}

#[test]
fn serial_port_has_a_single_owner() {
    let config = SerialConfig {
        path: "/dev/ttyKACO-owner-test".to_string(),
        ..SerialConfig::default()
    };

    let first = SerialConnector::new(config.clone()).expect("first owner");
    assert!(matches!(
        SerialConnector::new(config.clone()),
        Err(TransportError::PortInUse(_))
    ));

    drop(first);
    SerialConnector::new(config).expect("released port");
}

#[test]
fn serial_config_is_validated() {
    let mut config = SerialConfig {
        path: "/dev/ttyKACO-validate-test".to_string(),
        ..SerialConfig::default()
    };
    assert!(config.validate().is_ok());

    config.baud_rate = 1234;
    assert!(matches!(
        config.validate(),
        Err(TransportError::InvalidSerialConfig(_))
    ));

    config.baud_rate = 9600;
    config.path = " ".to_string();
    assert!(config.validate().is_err());

    config.path = "/dev/ttyKACO-validate-test".to_string();
    config.data_bits = 9;
    assert!(config.validate().is_err());
}

#[test]
fn link_failures_classify_as_bus_errors() {
    let errors = vec![
        TransportError::Timeout { timeout_ms: 500 },
        TransportError::Bus(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
        TransportError::Offline { retry_in_ms: 1000 },
        TransportError::PortInUse("/dev/ttyUSB0".to_string()),
        TransportError::InvalidSerialConfig("baud rate 1234".to_string()),
        TransportError::Codec(CodecError::FrameTooShort),
        TransportError::Codec(CodecError::ChecksumMismatch {
            expected: 0x92,
            actual: 0x42,
        }),
        TransportError::UnexpectedAddress {
            expected: DeviceAddress::new(3).expect("address"),
            actual: DeviceAddress::new(4).expect("address"),
        },
    ];

    for err in &errors {
        assert_eq!(
            err.is_bus_error(),
            err.failure_kind() == FailureKind::BusError,
            "{err}"
        );
    }
    assert!(TransportError::InvalidSerialConfig(String::new()).is_bus_error());
    assert!(!TransportError::Timeout { timeout_ms: 1 }.is_bus_error());
}
