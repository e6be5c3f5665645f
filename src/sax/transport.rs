use crate::prelude::*;

use async_trait::async_trait;
use bytes::BytesMut;
use net2::TcpStreamExt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;

use crate::config;
use crate::sax::packet::{self, Frame, ResponseClass, TcpFrameFactory};
use crate::sax::packet_decoder::PacketDecoder;
use crate::sax::{ReadOutcome, RegisterAccess, WriteOutcome};
use crate::utils;

pub const CONNECT_TIMEOUT_SECS: u64 = 10;
pub const READ_TIMEOUT_SECS: u64 = 5;
/// How long a fire-and-forget write waits for the acknowledgment the device
/// may or may not send.
pub const WRITE_GRACE_MILLIS: u64 = 500;
pub const TCP_KEEPALIVE_SECS: u64 = 60;
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_SECS: u64 = 1;
/// Consecutive failures after which the connection is recycled up front.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;
/// A connection idle longer than this is recycled up front.
pub const STALE_CONNECTION_SECS: i64 = 300;

struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
    decoder: PacketDecoder,
}

enum ExchangeOutcome {
    Frame(Frame),
    /// No response inside the window. Only writes treat this as normal.
    NoReply,
    /// Peer closed the stream.
    Closed,
    /// The stream desynchronized; whatever follows cannot be trusted.
    Malformed(String),
    SocketError(String),
}

/// One TCP Modbus connection to one battery. All device I/O is serialized
/// through the connection mutex; there is never more than one request in
/// flight because the firmware cannot correlate concurrent transactions.
pub struct Transport {
    name: String,
    host: String,
    port: u16,
    unit_id: u8,
    use_tcp_nodelay: bool,
    connection: Mutex<Option<Connection>>,
    connect_pending: AtomicBool,
    consecutive_failures: AtomicU32,
    /// Unix seconds of the last successful operation, 0 = never.
    last_success: AtomicI64,
    next_transaction: AtomicU16,
}

impl Transport {
    pub fn new(battery: &config::Battery) -> Self {
        Self {
            name: battery.name().to_string(),
            host: battery.host().to_string(),
            port: battery.port(),
            unit_id: battery.unit_id(),
            use_tcp_nodelay: battery.use_tcp_nodelay(),
            connection: Mutex::new(None),
            connect_pending: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_success: AtomicI64::new(0),
            next_transaction: AtomicU16::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Attempts a single connection. Returns false when an attempt is already
    /// pending so concurrent callers cannot race the socket setup.
    pub async fn connect(&self) -> bool {
        if self
            .connect_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("{}: connect already pending", self.name);
            return false;
        }

        let connected = self.try_connect().await;
        self.connect_pending.store(false, Ordering::SeqCst);
        connected
    }

    async fn try_connect(&self) -> bool {
        let address = format!("{}:{}", self.host, self.port);
        info!("{}: connecting to {}", self.name, address);

        let timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                warn!("{}: connect to {} failed: {}", self.name, address, err);
                return false;
            }
            Err(_) => {
                warn!(
                    "{}: connect to {} timed out after {}s",
                    self.name, address, CONNECT_TIMEOUT_SECS
                );
                return false;
            }
        };

        let stream = match self.configure_stream(stream) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("{}: socket setup failed: {}", self.name, err);
                return false;
            }
        };

        *self.connection.lock().await = Some(Connection {
            stream,
            buffer: BytesMut::with_capacity(512),
            decoder: PacketDecoder::new(),
        });

        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.touch_success();
        info!("{}: connected to {}", self.name, address);
        true
    }

    fn configure_stream(&self, stream: TcpStream) -> Result<TcpStream> {
        let stream = stream.into_std()?;
        stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))?;
        let stream = TcpStream::from_std(stream)?;
        if self.use_tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(stream)
    }

    pub async fn close(&self) {
        if let Some(mut connection) = self.connection.lock().await.take() {
            let _ = connection.stream.shutdown().await;
            debug!("{}: connection closed", self.name);
        }
    }

    /// Connects if necessary, retrying with backoff. Bounded; gives up after
    /// `MAX_CONNECT_ATTEMPTS`.
    pub async fn ensure_connection(&self) -> bool {
        if self.is_connected().await {
            return true;
        }

        utils::retry_with_backoff(
            &format!("{}: connect", self.name),
            MAX_CONNECT_ATTEMPTS,
            Duration::from_secs(RETRY_BASE_DELAY_SECS),
            || self.connect(),
        )
        .await
    }

    /// Tears the connection down and tries to bring it back. The retry budget
    /// shrinks as failures accumulate so a dead battery is not hammered.
    pub async fn reconnect_on_error(&self) -> bool {
        self.close().await;

        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        let budget = reconnect_budget(failures);

        utils::retry_with_backoff(
            &format!("{}: reconnect", self.name),
            budget,
            Duration::from_secs(RETRY_BASE_DELAY_SECS),
            || self.connect(),
        )
        .await
    }

    /// True when the connection should be recycled before the next batch of
    /// work: too many consecutive failures, or idle past the staleness bound.
    pub fn should_force_reconnect(&self) -> bool {
        if self.consecutive_failures.load(Ordering::SeqCst) > MAX_CONSECUTIVE_FAILURES {
            return true;
        }

        let last = self.last_success.load(Ordering::SeqCst);
        last != 0 && chrono::Utc::now().timestamp() - last > STALE_CONNECTION_SECS
    }

    /// Atomic pilot write: power and power factor land in one transaction so
    /// the battery never runs on a half-updated command pair.
    pub async fn write_pilot_power(
        &self,
        address: u16,
        power: i32,
        power_factor: f64,
    ) -> WriteOutcome {
        if address != packet::PILOT_POWER_REGISTER {
            warn!(
                "{}: pilot writes are only valid at register {}, got {}",
                self.name,
                packet::PILOT_POWER_REGISTER,
                address
            );
            return WriteOutcome::Failed;
        }

        let scaled = match packet::scale_power_factor(power_factor) {
            Ok(scaled) => scaled,
            Err(err) => {
                warn!("{}: {}", self.name, err);
                return WriteOutcome::Failed;
            }
        };

        let values = vec![packet::encode_power(power), scaled];
        self.write_registers(address, values, self.unit_id).await
    }

    fn next_transaction(&self) -> u16 {
        self.next_transaction.fetch_add(1, Ordering::SeqCst)
    }

    fn touch_success(&self) {
        self.last_success
            .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn note_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
    }

    /// Sends one frame and waits for whatever the device answers. Holds the
    /// connection lock for the whole exchange.
    async fn exchange(&self, request: BytesMut, reply_timeout: Duration) -> ExchangeOutcome {
        let mut guard = self.connection.lock().await;
        let Some(connection) = guard.as_mut() else {
            return ExchangeOutcome::SocketError("connection closed".to_string());
        };

        if let Err(err) = connection.stream.write_all(&request).await {
            return ExchangeOutcome::SocketError(err.to_string());
        }

        match tokio::time::timeout(reply_timeout, Self::read_frame(connection)).await {
            Ok(Ok(Some(frame))) => ExchangeOutcome::Frame(frame),
            Ok(Ok(None)) => ExchangeOutcome::Closed,
            Ok(Err(err)) => ExchangeOutcome::Malformed(err.to_string()),
            Err(_) => ExchangeOutcome::NoReply,
        }
    }

    async fn read_frame(connection: &mut Connection) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = connection.decoder.decode(&mut connection.buffer)? {
                return Ok(Some(frame));
            }

            let read = connection.stream.read_buf(&mut connection.buffer).await?;
            if read == 0 {
                return connection.decoder.decode_eof(&mut connection.buffer);
            }
        }
    }

    /// Records a failed operation and tears the connection down when the
    /// error text says the link is gone.
    async fn socket_failure(&self, what: &str, text: &str) -> ResponseClass {
        self.note_failure();
        let class = packet::classify_error_text(text);
        warn!("{}: {} failed: {}", self.name, what, text);
        if class == ResponseClass::ConnectionError {
            self.close().await;
        }
        class
    }

    async fn connection_lost(&self, what: &str, why: &str) {
        self.note_failure();
        warn!("{}: {}: {}", self.name, what, why);
        self.close().await;
    }
}

#[async_trait]
impl RegisterAccess for Transport {
    async fn read_registers(&self, address: u16, count: u16, unit_id: u8) -> ReadOutcome {
        if !self.ensure_connection().await {
            return ReadOutcome::ConnectionError;
        }

        let request = TcpFrameFactory::read_hold(self.next_transaction(), unit_id, address, count);
        let timeout = Duration::from_secs(READ_TIMEOUT_SECS);

        match self.exchange(request, timeout).await {
            ExchangeOutcome::Frame(reply) => {
                if reply.is_exception() {
                    let code = reply.exception_code().unwrap_or(0);
                    match packet::classify_exception(reply.function_code, code) {
                        ResponseClass::ConnectionError => {
                            self.connection_lost(
                                "read",
                                &format!("exception {} at register {}", code, address),
                            )
                            .await;
                            ReadOutcome::ConnectionError
                        }
                        _ => {
                            debug!(
                                "{}: exception {} reading register {}",
                                self.name, code, address
                            );
                            ReadOutcome::NoData
                        }
                    }
                } else {
                    match reply.registers() {
                        Ok(registers) if registers.len() == count as usize => {
                            self.touch_success();
                            ReadOutcome::Data(registers)
                        }
                        Ok(registers) => {
                            warn!(
                                "{}: short read at register {}: wanted {}, got {}",
                                self.name,
                                address,
                                count,
                                registers.len()
                            );
                            ReadOutcome::NoData
                        }
                        Err(err) => {
                            warn!("{}: bad read response at register {}: {}", self.name, address, err);
                            ReadOutcome::NoData
                        }
                    }
                }
            }
            ExchangeOutcome::NoReply => {
                self.connection_lost(
                    "read",
                    &format!("no response for register {} within {:?}", address, timeout),
                )
                .await;
                ReadOutcome::ConnectionError
            }
            ExchangeOutcome::Closed => {
                self.connection_lost("read", "peer closed the connection").await;
                ReadOutcome::ConnectionError
            }
            ExchangeOutcome::Malformed(err) => {
                self.connection_lost("read", &err).await;
                ReadOutcome::ConnectionError
            }
            ExchangeOutcome::SocketError(err) => match self.socket_failure("read", &err).await {
                ResponseClass::ConnectionError => ReadOutcome::ConnectionError,
                _ => ReadOutcome::NoData,
            },
        }
    }

    async fn write_registers(&self, address: u16, values: Vec<u16>, unit_id: u8) -> WriteOutcome {
        if values.is_empty() {
            warn!("{}: empty write at register {}", self.name, address);
            return WriteOutcome::Failed;
        }

        if !self.ensure_connection().await {
            return WriteOutcome::ConnectionError;
        }

        // Writes are fire-and-forget: the firmware mangles transaction ids,
        // so the reply is classified but never correlated with the request.
        let request =
            TcpFrameFactory::write_multi(self.next_transaction(), unit_id, address, &values);
        let grace = Duration::from_millis(WRITE_GRACE_MILLIS);

        match self.exchange(request, grace).await {
            ExchangeOutcome::Frame(reply) => {
                if reply.is_exception() {
                    let code = reply.exception_code().unwrap_or(0);
                    match packet::classify_exception(reply.function_code, code) {
                        ResponseClass::Success => {
                            self.touch_success();
                            WriteOutcome::Ok
                        }
                        ResponseClass::ConnectionError => {
                            self.connection_lost(
                                "write",
                                &format!("exception {} at register {}", code, address),
                            )
                            .await;
                            WriteOutcome::ConnectionError
                        }
                        ResponseClass::ProtocolError => {
                            self.note_failure();
                            warn!(
                                "{}: write to register {} rejected with exception {}",
                                self.name, address, code
                            );
                            WriteOutcome::Failed
                        }
                    }
                } else {
                    self.touch_success();
                    WriteOutcome::Ok
                }
            }
            // Silence within the grace window is how this firmware says yes.
            ExchangeOutcome::NoReply => {
                self.touch_success();
                WriteOutcome::Ok
            }
            ExchangeOutcome::Closed => {
                self.connection_lost("write", "peer closed the connection").await;
                WriteOutcome::ConnectionError
            }
            ExchangeOutcome::Malformed(err) => {
                self.connection_lost("write", &err).await;
                WriteOutcome::ConnectionError
            }
            ExchangeOutcome::SocketError(err) => match self.socket_failure("write", &err).await {
                ResponseClass::ConnectionError => WriteOutcome::ConnectionError,
                _ => WriteOutcome::Failed,
            },
        }
    }
}

/// Attempts allowed for the next reconnect, one fewer per five accumulated
/// failures, never below one.
pub fn reconnect_budget(failures: u32) -> u32 {
    std::cmp::max(1, MAX_CONNECT_ATTEMPTS.saturating_sub(failures / 5))
}
