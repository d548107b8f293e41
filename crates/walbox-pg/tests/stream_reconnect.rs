//! Stream client against an in-process fake replication server.
//!
//! The fake speaks just enough of the protocol for one session: trust authentication,
//! the three replication commands and a CopyBoth stream carrying a Relation and an
//! Insert. The first `dropped` connections end their stream right after the insert;
//! later ones stay open until the client terminates.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use chrono::{TimeZone, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use walbox_config::{ConnectionParams, ReconcileConfig, SslMode};
use walbox_core::{MockPublisher, OutboxMessage};
use walbox_pg::{
    Capabilities, Delivery, MemoryOutboxStore, PgError, ReconcileReport, Reconciler,
    ReconnectPolicy, StreamRunner, StreamSettings,
};

const RELATION_ID: u32 = 16384;
const XLOGPOS: [&str; 2] = ["0/16B3748", "0/1700000"];

const OUTBOX_COLUMNS: [(&str, u32); 9] = [
    ("id", 20),
    ("message", 3802),
    ("exchange", 25),
    ("v_host", 25),
    ("router_key", 25),
    ("correlation_id", 25),
    ("reply_to", 25),
    ("created_at", 1184),
    ("sent", 16),
];

#[derive(Default)]
struct ServerLog {
    queries: Vec<Vec<String>>,
    terminated: usize,
}

fn message(tag: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.extend_from_slice(body);
    buf
}

fn ready() -> BytesMut {
    message(b'Z', b"I")
}

fn command_complete(tag: &str) -> BytesMut {
    let mut body = tag.as_bytes().to_vec();
    body.push(0);
    message(b'C', &body)
}

fn data_row(values: &[&str]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(values.len() as i16);
    for value in values {
        body.put_i32(value.len() as i32);
        body.extend_from_slice(value.as_bytes());
    }
    message(b'D', &body)
}

fn xlog(wal_start: u64, payload: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(b'w');
    body.put_u64(wal_start);
    body.put_u64(wal_start);
    body.put_i64(0);
    body.extend_from_slice(payload);
    message(b'd', &body)
}

fn relation_payload() -> Vec<u8> {
    let mut buf = vec![b'R'];
    buf.put_u32(RELATION_ID);
    buf.extend_from_slice(b"public\0outbox\0");
    buf.put_u8(b'd');
    buf.put_u16(OUTBOX_COLUMNS.len() as u16);
    for (name, oid) in OUTBOX_COLUMNS {
        buf.put_u8(0);
        buf.extend_from_slice(name.as_bytes());
        buf.put_u8(0);
        buf.put_u32(oid);
        buf.put_i32(-1);
    }
    buf
}

fn insert_payload(id: i64) -> Vec<u8> {
    let id_text = id.to_string();
    let payload = format!(r#"{{"order":{}}}"#, id);
    let correlation = format!("corr-{}", id);
    let values = [
        Some(id_text.as_str()),
        Some(payload.as_str()),
        Some("orders"),
        None,
        Some("order.created"),
        Some(correlation.as_str()),
        None,
        Some("2024-05-01 12:00:00+00"),
        Some("f"),
    ];

    let mut buf = vec![b'I'];
    buf.put_u32(RELATION_ID);
    buf.put_u8(b'N');
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            Some(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.extend_from_slice(text.as_bytes());
            }
            None => buf.put_u8(b'n'),
        }
    }
    buf
}

async fn read_message(sock: &mut TcpStream) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let tag = match sock.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let len = sock.read_i32().await?;
    let mut body = vec![0u8; len as usize - 4];
    sock.read_exact(&mut body).await?;
    Ok(Some((tag, body)))
}

async fn handle_connection(
    mut sock: TcpStream,
    index: usize,
    drop_stream: bool,
    log: Arc<Mutex<ServerLog>>,
) -> std::io::Result<()> {
    let startup_len = sock.read_i32().await?;
    let mut startup = vec![0u8; startup_len as usize - 4];
    sock.read_exact(&mut startup).await?;

    let mut out = message(b'R', &0i32.to_be_bytes());
    out.extend_from_slice(&ready());
    sock.write_all(&out).await?;

    log.lock().unwrap().queries.push(Vec::new());

    while let Some((tag, body)) = read_message(&mut sock).await? {
        match tag {
            b'Q' => {
                let query = String::from_utf8_lossy(&body[..body.len() - 1]).into_owned();
                log.lock().unwrap().queries[index].push(query.clone());

                if query.starts_with("CREATE_REPLICATION_SLOT") {
                    let mut out = command_complete("CREATE_REPLICATION_SLOT");
                    out.extend_from_slice(&ready());
                    sock.write_all(&out).await?;
                } else if query.starts_with("IDENTIFY_SYSTEM") {
                    let mut out = data_row(&["7301234567890123456", "1", XLOGPOS[index.min(1)], "app"]);
                    out.extend_from_slice(&command_complete("IDENTIFY_SYSTEM"));
                    out.extend_from_slice(&ready());
                    sock.write_all(&out).await?;
                } else if query.starts_with("START_REPLICATION") {
                    let base = 0x0200_0000 * (index as u64 + 1);
                    let mut out = message(b'W', &[0, 0, 0]);
                    out.extend_from_slice(&xlog(base, &relation_payload()));
                    out.extend_from_slice(&xlog(base + 0x100, &insert_payload(index as i64 + 1)));
                    sock.write_all(&out).await?;

                    if drop_stream {
                        // end the stream; keep reading until the client hangs up
                        sock.shutdown().await?;
                    }
                } else {
                    sock.write_all(&ready()).await?;
                }
            }
            b'X' => {
                log.lock().unwrap().terminated += 1;
                return Ok(());
            }
            // standby status updates and CopyDone
            _ => {}
        }
    }
    Ok(())
}

async fn start_fake_server(dropped: usize) -> (u16, Arc<Mutex<ServerLog>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log = Arc::new(Mutex::new(ServerLog::default()));

    let server_log = log.clone();
    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((sock, _)) = listener.accept().await {
            tokio::spawn(handle_connection(
                sock,
                index,
                index < dropped,
                server_log.clone(),
            ));
            index += 1;
        }
    });

    (port, log)
}

fn settings(port: u16) -> StreamSettings {
    StreamSettings {
        params: ConnectionParams {
            host: "127.0.0.1".to_string(),
            port,
            dbname: "app".to_string(),
            user: "walbox".to_string(),
            password: None,
            ssl_mode: SslMode::Disable,
        },
        connect_timeout: Duration::from_secs(5),
        status_interval: Duration::from_secs(10),
        slot_prefix: "walbox".to_string(),
        publication: "outbox_publication".to_string(),
    }
}

fn policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        stable_after: Duration::from_secs(60),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("walbox_pg=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_stream_reconnects_with_fresh_slot_and_position() {
    init_tracing();
    let (port, log) = start_fake_server(1).await;

    let publisher = MockPublisher::new();
    let store = MemoryOutboxStore::new();
    let delivery = Delivery::new(
        Arc::new(publisher.clone()),
        Arc::new(store.clone()),
        Capabilities {
            has_sent_column: true,
        },
    );
    let cancel = CancellationToken::new();

    let runner = StreamRunner::new(settings(port), policy(3));
    let token = cancel.clone();
    let handle = tokio::spawn(async move { runner.run(&delivery, &token).await });

    tokio::time::timeout(Duration::from_secs(10), async {
        while publisher.published_ids().len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("both rows should be delivered");

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("runner should stop after cancel")
        .unwrap();
    assert!(result.is_ok());

    assert_eq!(publisher.published_ids(), vec![1, 2]);
    assert_eq!(store.mark_sent_calls(), vec![1, 2]);

    let first = &publisher.published()[0];
    assert_eq!(first.message, serde_json::json!({"order": 1}));
    assert_eq!(first.exchange, "orders");
    assert_eq!(first.routing_key, "order.created");
    assert_eq!(first.correlation_id, "corr-1");
    assert_eq!(first.reply_to, "");
    assert_eq!(first.virtual_host, "");
    assert_eq!(
        first.created_at,
        Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    );
    assert!(!first.sent);

    tokio::time::timeout(Duration::from_secs(5), async {
        while log.lock().unwrap().terminated == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client should terminate the second session");

    let log = log.lock().unwrap();
    assert_eq!(log.queries.len(), 2);

    let slot_of = |queries: &[String]| -> String {
        let create = queries
            .iter()
            .find(|q| q.starts_with("CREATE_REPLICATION_SLOT"))
            .unwrap();
        assert!(create.ends_with("TEMPORARY LOGICAL pgoutput NOEXPORT_SNAPSHOT"));
        create.split_whitespace().nth(1).unwrap().to_string()
    };
    let first_slot = slot_of(&log.queries[0]);
    let second_slot = slot_of(&log.queries[1]);
    assert!(first_slot.starts_with("\"walbox_"));
    assert_ne!(first_slot, second_slot);

    for (queries, lsn) in log.queries.iter().zip(XLOGPOS) {
        let start = queries
            .iter()
            .find(|q| q.starts_with("START_REPLICATION"))
            .unwrap();
        assert!(start.contains(&format!("LOGICAL {} ", lsn)), "{}", start);
        assert!(start.contains("proto_version '1'"));
        assert!(start.contains("outbox_publication"));
    }
}

#[tokio::test]
async fn test_stream_publish_failure_is_not_fatal() {
    init_tracing();
    let (port, _log) = start_fake_server(1).await;

    let publisher = MockPublisher::new();
    publisher.fail_id(1, 1);
    let store = MemoryOutboxStore::new();
    let delivery = Delivery::new(
        Arc::new(publisher.clone()),
        Arc::new(store.clone()),
        Capabilities {
            has_sent_column: true,
        },
    );
    let cancel = CancellationToken::new();

    let runner = StreamRunner::new(settings(port), policy(3));
    let token = cancel.clone();
    let handle = tokio::spawn(async move { runner.run(&delivery, &token).await });

    tokio::time::timeout(Duration::from_secs(10), async {
        while publisher.published_ids().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("second row should be delivered");

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());

    // row 1 stays unsent for the reconciler
    assert_eq!(publisher.published_ids(), vec![2]);
    assert_eq!(store.mark_sent_calls(), vec![2]);
}

#[tokio::test]
async fn test_reconnect_budget_is_bounded() {
    init_tracing();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let delivery = Delivery::new(
        Arc::new(MockPublisher::new()),
        Arc::new(MemoryOutboxStore::new()),
        Capabilities::default(),
    );
    let cancel = CancellationToken::new();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        StreamRunner::new(settings(port), policy(3)).run(&delivery, &cancel),
    )
    .await
    .expect("runner should give up");

    assert!(matches!(
        result,
        Err(PgError::ReconnectExhausted { attempts: 3 })
    ));
}

#[tokio::test]
async fn test_cancel_before_connect_returns_ok() {
    let delivery = Delivery::new(
        Arc::new(MockPublisher::new()),
        Arc::new(MemoryOutboxStore::new()),
        Capabilities::default(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = StreamRunner::new(settings(1), policy(3))
        .run(&delivery, &cancel)
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_sessions_that_drop_immediately_exhaust_the_budget() {
    init_tracing();
    let (port, log) = start_fake_server(usize::MAX).await;

    let publisher = MockPublisher::new();
    let delivery = Delivery::new(
        Arc::new(publisher.clone()),
        Arc::new(MemoryOutboxStore::new()),
        Capabilities::default(),
    );
    let cancel = CancellationToken::new();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        StreamRunner::new(settings(port), policy(3)).run(&delivery, &cancel),
    )
    .await
    .expect("runner should give up on a server that keeps dropping sessions");

    assert!(matches!(
        result,
        Err(PgError::ReconnectExhausted { attempts: 3 })
    ));
    assert_eq!(publisher.published_ids(), vec![1, 2, 3]);
    assert_eq!(log.lock().unwrap().queries.len(), 3);
}

fn unsent_row(id: i64) -> OutboxMessage {
    OutboxMessage {
        id,
        message: serde_json::json!({ "order": id }),
        exchange: "orders".to_string(),
        routing_key: "order.created".to_string(),
        correlation_id: format!("corr-{}", id),
        reply_to: String::new(),
        virtual_host: String::new(),
        created_at: Some(Utc::now() - chrono::Duration::minutes(1)),
        sent: false,
    }
}

#[tokio::test]
async fn test_row_failed_on_stream_is_recovered_by_reconciler() {
    init_tracing();
    let (port, _log) = start_fake_server(1).await;

    let publisher = MockPublisher::new();
    publisher.fail_id(2, 1);
    let store = MemoryOutboxStore::new();
    store.insert(unsent_row(1));
    store.insert(unsent_row(2));
    let delivery = Delivery::new(
        Arc::new(publisher.clone()),
        Arc::new(store.clone()),
        Capabilities {
            has_sent_column: true,
        },
    );
    let cancel = CancellationToken::new();

    let runner = StreamRunner::new(settings(port), policy(3));
    let stream_delivery = delivery.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { runner.run(&stream_delivery, &token).await });

    tokio::time::timeout(Duration::from_secs(10), async {
        while publisher.attempts() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("both rows should reach the publisher");

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());

    assert_eq!(publisher.published_ids(), vec![1]);
    assert!(store.is_sent(1));
    assert!(!store.is_sent(2));

    let reconciler = Reconciler::new(delivery, &ReconcileConfig::default());
    let report = reconciler.reconcile_once().await.unwrap();

    assert_eq!(
        report,
        ReconcileReport {
            found: 1,
            delivered: 1,
            failed: 0,
        }
    );
    assert_eq!(publisher.published_ids(), vec![1, 2]);
    assert_eq!(publisher.attempts(), 3);
    assert_eq!(store.mark_sent_calls(), vec![1, 2]);
    assert!(store.is_sent(2));
}
