//! Replication-mode connection speaking the frontend/backend protocol directly.
//!
//! A logical replication session needs a connection started with `replication=database`
//! so that replication commands (`CREATE_REPLICATION_SLOT`, `IDENTIFY_SYSTEM`,
//! `START_REPLICATION`) are accepted and the temporary slot lives as long as the
//! connection. Message encoding uses `postgres_protocol::message::frontend`; backend
//! messages are framed here from a read buffer so that [`ReplicationConnection::recv`]
//! can be cancelled at any await point without losing bytes.

use std::error::Error as StdError;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::message::frontend;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::{debug, info, warn};
use walbox_config::ConnectionParams;

use super::lsn::{format_lsn, parse_lsn};
use super::publication::quote_ident;
use crate::connect::{tls_connector, APPLICATION_NAME};
use crate::error::{PgError, PgResult};

/// Seconds between the Unix epoch and the Postgres epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Largest backend message accepted.
const MAX_MESSAGE_LEN: usize = 1 << 30;

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// One message read from the server in CopyBoth mode.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    /// WAL data carrying one pgoutput message.
    XLogData {
        wal_start: u64,
        wal_end: u64,
        server_time: i64,
        data: Bytes,
    },
    /// Primary keepalive.
    Keepalive {
        wal_end: u64,
        server_time: i64,
        reply_requested: bool,
    },
    /// A CopyData kind this client does not act on.
    Other(u8),
}

/// Result of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: u32,
    pub xlogpos: u64,
    pub dbname: Option<String>,
}

struct BackendMessage {
    tag: u8,
    body: Bytes,
}

/// A connection in replication mode.
pub struct ReplicationConnection {
    stream: Box<dyn AsyncStream>,
    buf: BytesMut,
}

impl ReplicationConnection {
    /// Open a replication-mode connection and authenticate.
    pub async fn connect(params: &ConnectionParams, connect_timeout: Duration) -> PgResult<Self> {
        tokio::time::timeout(connect_timeout, Self::establish(params))
            .await
            .map_err(|_| {
                PgError::Connection(format!(
                    "timed out after {}s connecting to {}",
                    connect_timeout.as_secs(),
                    params
                ))
            })?
    }

    async fn establish(params: &ConnectionParams) -> PgResult<Self> {
        debug!(server = %params, sslmode = %params.ssl_mode, "Opening replication connection");

        let tcp = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| PgError::Connection(format!("{}: {}", params, e)))?;
        tcp.set_nodelay(true)?;

        let stream = Self::negotiate_tls(tcp, params).await?;
        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
        };

        conn.startup(params).await?;
        info!(server = %params, "Replication connection established");
        Ok(conn)
    }

    async fn negotiate_tls(mut tcp: TcpStream, params: &ConnectionParams) -> PgResult<Box<dyn AsyncStream>> {
        if !params.ssl_mode.attempts_tls() {
            return Ok(Box::new(tcp));
        }

        let mut buf = BytesMut::new();
        frontend::ssl_request(&mut buf);
        tcp.write_all(&buf).await?;
        tcp.flush().await?;

        match tcp.read_u8().await? {
            b'S' => {
                let mut maker = tls_connector()?;
                let connect =
                    <MakeRustlsConnect as MakeTlsConnect<TcpStream>>::make_tls_connect(&mut maker, &params.host)
                        .map_err(tls_error)?;
                let tls = connect.connect(tcp).await.map_err(tls_error)?;
                debug!("TLS negotiated for replication connection");
                Ok(Box::new(tls))
            }
            b'N' if params.ssl_mode.requires_tls() => Err(PgError::Connection(format!(
                "server does not support TLS (sslmode={})",
                params.ssl_mode
            ))),
            b'N' => {
                debug!("Server refused TLS, continuing without it");
                Ok(Box::new(tcp))
            }
            other => Err(PgError::Protocol(format!(
                "unexpected response to SSLRequest: 0x{:02X}",
                other
            ))),
        }
    }

    async fn startup(&mut self, params: &ConnectionParams) -> PgResult<()> {
        let startup_params = [
            ("user", params.user.as_str()),
            ("database", params.dbname.as_str()),
            ("replication", "database"),
            ("application_name", APPLICATION_NAME),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(startup_params, &mut buf)?;
        self.send(&buf).await?;

        self.authenticate(params).await?;

        loop {
            let msg = self.read_message().await?;
            match msg.tag {
                b'Z' => return Ok(()),
                b'E' => return Err(server_error(msg.body)),
                b'N' => log_notice(msg.body),
                // ParameterStatus and BackendKeyData
                _ => {}
            }
        }
    }

    async fn authenticate(&mut self, params: &ConnectionParams) -> PgResult<()> {
        let mut scram: Option<ScramSha256> = None;

        loop {
            let msg = self.read_message().await?;
            let mut body = match msg.tag {
                b'R' => msg.body,
                b'E' => return Err(server_error(msg.body)),
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message during authentication: '{}'",
                        other as char
                    )))
                }
            };

            let mut buf = BytesMut::new();
            match take_i32(&mut body)? {
                0 => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                3 => {
                    let password = require_password(params)?;
                    frontend::password_message(password.as_bytes(), &mut buf)?;
                }
                5 => {
                    let password = require_password(params)?;
                    if body.remaining() < 4 {
                        return Err(PgError::Protocol("truncated md5 salt".into()));
                    }
                    let mut salt = [0u8; 4];
                    body.copy_to_slice(&mut salt);
                    let hash = md5_hash(params.user.as_bytes(), password.as_bytes(), salt);
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                }
                10 => {
                    let password = require_password(params)?;
                    let mut mechanisms = Vec::new();
                    while body.first().is_some_and(|b| *b != 0) {
                        mechanisms.push(take_cstr(&mut body)?);
                    }
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(PgError::Connection(format!(
                            "no supported SASL mechanism in {:?}",
                            mechanisms
                        )));
                    }
                    let exchange = ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());
                    frontend::sasl_initial_response(SCRAM_SHA_256, exchange.message(), &mut buf)?;
                    scram = Some(exchange);
                }
                11 => {
                    let exchange = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("SASL continue without SASL start".into()))?;
                    exchange
                        .update(&body)
                        .map_err(|e| PgError::Connection(format!("SCRAM exchange failed: {}", e)))?;
                    frontend::sasl_response(exchange.message(), &mut buf)?;
                }
                12 => {
                    let exchange = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("SASL final without SASL start".into()))?;
                    exchange
                        .finish(&body)
                        .map_err(|e| PgError::Connection(format!("SCRAM verification failed: {}", e)))?;
                    continue;
                }
                other => {
                    return Err(PgError::Connection(format!(
                        "unsupported authentication method: {}",
                        other
                    )))
                }
            }
            self.send(&buf).await?;
        }
    }

    /// Run a replication command in simple-query mode and return its text rows.
    pub async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<Vec<Option<String>>>> {
        debug!(query = %sql, "Replication command");
        let mut buf = BytesMut::new();
        frontend::query(sql, &mut buf)?;
        self.send(&buf).await?;

        let mut rows = Vec::new();
        let mut error = None;
        loop {
            let msg = self.read_message().await?;
            match msg.tag {
                b'D' => rows.push(parse_data_row(msg.body)?),
                b'E' => error = Some(server_error(msg.body)),
                b'N' => log_notice(msg.body),
                b'Z' => break,
                // RowDescription, CommandComplete, EmptyQueryResponse, ParameterStatus
                _ => {}
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// Create a temporary logical slot that is dropped when this connection closes.
    pub async fn create_temporary_slot(&mut self, slot_name: &str) -> PgResult<()> {
        self.simple_query(&format!(
            "CREATE_REPLICATION_SLOT {} TEMPORARY LOGICAL pgoutput NOEXPORT_SNAPSHOT",
            quote_ident(slot_name)
        ))
        .await?;
        Ok(())
    }

    pub async fn identify_system(&mut self) -> PgResult<SystemIdentity> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| PgError::Protocol("IDENTIFY_SYSTEM returned no rows".into()))?;

        let field = |idx: usize, name: &str| -> PgResult<String> {
            row.get(idx)
                .cloned()
                .flatten()
                .ok_or_else(|| PgError::Protocol(format!("IDENTIFY_SYSTEM missing {}", name)))
        };

        let timeline = field(1, "timeline")?;
        Ok(SystemIdentity {
            system_id: field(0, "systemid")?,
            timeline: timeline
                .parse()
                .map_err(|_| PgError::Protocol(format!("invalid timeline '{}'", timeline)))?,
            xlogpos: parse_lsn(&field(2, "xlogpos")?)?,
            dbname: row.get(3).cloned().flatten(),
        })
    }

    /// Start streaming from `start_lsn` and switch the connection into CopyBoth mode.
    pub async fn start_replication(&mut self, slot_name: &str, start_lsn: u64, publication: &str) -> PgResult<()> {
        let publication_names = quote_ident(publication).replace('\'', "''");
        let sql = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            quote_ident(slot_name),
            format_lsn(start_lsn),
            publication_names
        );
        debug!(query = %sql, "Replication command");

        let mut buf = BytesMut::new();
        frontend::query(&sql, &mut buf)?;
        self.send(&buf).await?;

        loop {
            let msg = self.read_message().await?;
            match msg.tag {
                b'W' => return Ok(()),
                b'E' => return Err(server_error(msg.body)),
                b'N' => log_notice(msg.body),
                b'S' => {}
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected response to START_REPLICATION: '{}'",
                        other as char
                    )))
                }
            }
        }
    }

    /// Receive the next CopyData frame.
    ///
    /// Cancel-safe: bytes already read stay buffered for the next call.
    pub async fn recv(&mut self) -> PgResult<ReplicationFrame> {
        loop {
            let msg = self.read_message().await?;
            match msg.tag {
                b'd' => return parse_copy_data(msg.body),
                b'c' => {
                    debug!("Server sent CopyDone");
                    return Err(PgError::StreamEnded);
                }
                b'E' => return Err(server_error(msg.body)),
                b'N' => log_notice(msg.body),
                other => debug!(tag = %(other as char), "Ignoring backend message"),
            }
        }
    }

    /// Report `lsn` as written, flushed and applied.
    pub async fn send_standby_status(&mut self, lsn: u64) -> PgResult<()> {
        let frame = encode_standby_status(lsn, pg_now_micros());
        self.send(&frame).await
    }

    /// End the session. Best effort: errors are logged and dropped.
    pub async fn close(mut self) {
        let mut buf = BytesMut::new();
        frontend::copy_done(&mut buf);
        frontend::terminate(&mut buf);

        if let Err(e) = self.send(&buf).await {
            debug!(error = %e, "Failed to send termination");
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!(error = %e, "Failed to shut down replication connection");
        }
    }

    async fn send(&mut self, data: &[u8]) -> PgResult<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(msg) = try_parse_message(&mut self.buf)? {
                return Ok(msg);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(PgError::StreamEnded);
            }
        }
    }
}

/// Split one complete backend message off the front of `buf`, if present.
fn try_parse_message(buf: &mut BytesMut) -> PgResult<Option<BackendMessage>> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let len = usize::try_from(len)
        .ok()
        .filter(|l| (4..=MAX_MESSAGE_LEN).contains(l))
        .ok_or_else(|| PgError::Protocol(format!("invalid message length: {}", len)))?;

    if buf.len() < len + 1 {
        buf.reserve(len + 1 - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(len + 1);
    let tag = frame[0];
    frame.advance(5);
    Ok(Some(BackendMessage {
        tag,
        body: frame.freeze(),
    }))
}

/// Parse the payload of a CopyData message received in CopyBoth mode.
pub fn parse_copy_data(mut body: Bytes) -> PgResult<ReplicationFrame> {
    if body.is_empty() {
        return Err(PgError::Protocol("empty CopyData".into()));
    }

    match body.get_u8() {
        b'w' => {
            if body.remaining() < 24 {
                return Err(PgError::Protocol("truncated XLogData header".into()));
            }
            let wal_start = body.get_u64();
            let wal_end = body.get_u64();
            let server_time = body.get_i64();
            Ok(ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                server_time,
                data: body,
            })
        }
        b'k' => {
            if body.remaining() < 17 {
                return Err(PgError::Protocol("truncated keepalive".into()));
            }
            Ok(ReplicationFrame::Keepalive {
                wal_end: body.get_u64(),
                server_time: body.get_i64(),
                reply_requested: body.get_u8() != 0,
            })
        }
        other => Ok(ReplicationFrame::Other(other)),
    }
}

/// Encode a standby status update as a complete CopyData message.
pub fn encode_standby_status(lsn: u64, now_micros: i64) -> BytesMut {
    let mut frame = BytesMut::with_capacity(39);
    frame.put_u8(b'd');
    frame.put_i32(4 + 34);
    frame.put_u8(b'r');
    frame.put_u64(lsn); // written
    frame.put_u64(lsn); // flushed
    frame.put_u64(lsn); // applied
    frame.put_i64(now_micros);
    frame.put_u8(0);
    frame
}

/// Microseconds since the Postgres epoch.
fn pg_now_micros() -> i64 {
    let now = Utc::now();
    (now.timestamp() - PG_EPOCH_OFFSET_SECS) * 1_000_000 + i64::from(now.timestamp_subsec_micros())
}

fn parse_data_row(mut body: Bytes) -> PgResult<Vec<Option<String>>> {
    if body.remaining() < 2 {
        return Err(PgError::Protocol("truncated DataRow".into()));
    }
    let count = body.get_i16();
    let mut values = Vec::with_capacity(count.max(0) as usize);

    for _ in 0..count {
        let len = take_i32(&mut body)?;
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if body.remaining() < len {
            return Err(PgError::Protocol("truncated DataRow value".into()));
        }
        let raw = body.split_to(len);
        values.push(Some(String::from_utf8_lossy(&raw).into_owned()));
    }

    Ok(values)
}

/// Decode an ErrorResponse body into [`PgError::Server`].
fn server_error(body: Bytes) -> PgError {
    let fields = parse_fields(body);
    let field = |code: u8| {
        fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };

    let severity = match field(b'V') {
        s if s.is_empty() => field(b'S'),
        s => s,
    };
    PgError::Server {
        severity,
        code: field(b'C'),
        message: field(b'M'),
    }
}

fn log_notice(body: Bytes) {
    let fields = parse_fields(body);
    let message = fields
        .iter()
        .find(|(c, _)| *c == b'M')
        .map(|(_, v)| v.as_str())
        .unwrap_or_default();
    warn!(notice = %message, "Server notice");
}

fn parse_fields(mut body: Bytes) -> Vec<(u8, String)> {
    let mut fields = Vec::new();
    while body.has_remaining() {
        let code = body.get_u8();
        if code == 0 {
            break;
        }
        match take_cstr(&mut body) {
            Ok(value) => fields.push((code, value)),
            Err(_) => break,
        }
    }
    fields
}

fn take_i32(body: &mut Bytes) -> PgResult<i32> {
    if body.remaining() < 4 {
        return Err(PgError::Protocol("truncated message".into()));
    }
    Ok(body.get_i32())
}

fn take_cstr(body: &mut Bytes) -> PgResult<String> {
    let end = body
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| PgError::Protocol("unterminated string".into()))?;
    let raw = body.split_to(end);
    body.advance(1);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn require_password(params: &ConnectionParams) -> PgResult<&str> {
    params
        .password
        .as_deref()
        .ok_or_else(|| PgError::Connection("password required but not provided".into()))
}

fn tls_error<E: Into<Box<dyn StdError + Send + Sync>>>(e: E) -> PgError {
    PgError::Connection(format!("TLS handshake failed: {}", e.into()))
}
