//! Connector WebSocket Client
//!
//! Runs next to a brokerage terminal and keeps one channel open to the
//! bridge. Commands arriving on the channel are executed against a
//! [`TerminalPort`] and answered on the same channel.
//!
//! # Protocol
//!
//! - `PING` is answered with `PONG` carrying terminal status.
//! - `TRADE_OPEN` / `TRADE_CLOSE` / `TRADE_MODIFY` are answered with `TRADE_RESULT`.
//! - `SYNC_REQUEST`, `GET_POSITIONS` and `GET_ACCOUNT` are answered with
//!   `SYNC_RESPONSE`, `POSITIONS` and `ACCOUNT_INFO`.
//!
//! Liveness uses transport-level pings; the connector never sends a `PING`
//! envelope.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::application::ports::{TerminalCommand, TerminalError, TerminalPort};
use crate::domain::envelope::{
    AccountInfoPayload, CodecError, Envelope, EnvelopeCodec, PongPayload, PositionsPayload,
    RequestPayload, SyncResponsePayload, TradeCommandPayload, TradeResultPayload,
};
use crate::domain::identity::{AccountId, ConnectionId, CorrelationId};
use crate::domain::trade::TradeAction;
use crate::error::ErrorCode;
use crate::infrastructure::config::{ConfigError, Lookup, ReconnectSettings};
use crate::infrastructure::connection::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, LivenessState, ReconnectSupervisor,
};
use crate::infrastructure::metrics;

/// Close codes after which reconnecting cannot help: unauthorized,
/// ownership conflict, replaced by a newer connector.
const FATAL_CLOSE_CODES: [u16; 3] = [4001, 4003, 4010];

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the connector client.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorClientError {
    /// Bridge URL or token cannot form a request.
    #[error("invalid connection request: {0}")]
    InvalidRequest(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The bridge closed the channel with a code that forbids retrying.
    #[error("bridge refused the connector ({code}): {reason}")]
    Refused {
        /// WebSocket close code.
        code: u16,
        /// Close reason text.
        reason: String,
    },

    /// No traffic from the bridge within the silence timeout.
    #[error("bridge silent for {0:?}")]
    Silent(Duration),

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Reconnect attempts exhausted.
    #[error("reconnect failed after {attempts} attempts")]
    ReconnectFailed {
        /// Attempts made.
        attempts: u32,
    },
}

// =============================================================================
// Events
// =============================================================================

/// Events emitted by the connector client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// Channel is open.
    Connected,
    /// Channel dropped.
    Disconnected {
        /// Why.
        reason: String,
    },
    /// Waiting before the next attempt.
    Reconnecting {
        /// Attempt number (1-based).
        attempt: u32,
        /// Sleep before the attempt.
        delay: Duration,
    },
    /// Gave up reconnecting.
    ReconnectFailed {
        /// Attempts made.
        attempts: u32,
    },
    /// A trade command was answered.
    CommandExecuted {
        /// Command correlation id.
        correlation_id: CorrelationId,
        /// Whether the terminal filled it.
        success: bool,
    },
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the connector client.
#[derive(Clone)]
pub struct ConnectorClientConfig {
    /// Bridge endpoint, e.g. `wss://bridge.example.com/ws/connector`.
    pub url: String,
    /// Connector bearer token.
    pub token: String,
    /// Connection id to register under.
    pub connection_id: ConnectionId,
    /// Account stamped on replies, when known locally.
    pub account_id: Option<AccountId>,
    /// Broker label when the terminal does not report one.
    pub broker: Option<String>,
    /// Reconnection policy.
    pub reconnect: ReconnectSupervisor,
    /// Transport ping policy.
    pub heartbeat: HeartbeatConfig,
}

impl std::fmt::Debug for ConnectorClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorClientConfig")
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .field("connection_id", &self.connection_id)
            .field("account_id", &self.account_id)
            .field("broker", &self.broker)
            .field("reconnect", &self.reconnect)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl ConnectorClientConfig {
    /// Create a configuration with default reconnect and heartbeat policy.
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>, connection_id: ConnectionId) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            connection_id,
            account_id: None,
            broker: None,
            reconnect: ReconnectSupervisor::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// Load from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    ///
    /// Requires `CONNECTOR_BRIDGE_URL`, `CONNECTOR_TOKEN` and
    /// `CONNECTOR_CONNECTION_ID`; `CONNECTOR_ACCOUNT_ID`, `CONNECTOR_BROKER`
    /// and the `BRIDGE_RECONNECT_*` policy are optional.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or empty.
    pub fn from_lookup(env: Lookup<'_>) -> Result<Self, ConfigError> {
        let required = |key: &str| -> Result<String, ConfigError> {
            let value = env(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyValue(key.to_string()));
            }
            Ok(value)
        };
        let optional = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let mut config = Self::new(
            required("CONNECTOR_BRIDGE_URL")?,
            required("CONNECTOR_TOKEN")?,
            ConnectionId::new(required("CONNECTOR_CONNECTION_ID")?),
        );
        config.account_id = optional("CONNECTOR_ACCOUNT_ID").map(AccountId::new);
        config.broker = optional("CONNECTOR_BROKER");
        config.reconnect = ReconnectSupervisor::from_settings(&ReconnectSettings::from_lookup(env)?);
        Ok(config)
    }

    /// Endpoint with the registration query attached.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorClientError::InvalidRequest`] for a malformed URL.
    pub fn endpoint(&self) -> Result<Url, ConnectorClientError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| ConnectorClientError::InvalidRequest(format!("{}: {e}", self.url)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("connection_id", self.connection_id.as_str());
            if let Some(broker) = &self.broker {
                query.append_pair("broker", broker);
            }
        }
        Ok(url)
    }
}

// =============================================================================
// Client
// =============================================================================

/// Connector-side channel to the bridge.
pub struct ConnectorClient<T: TerminalPort + ?Sized> {
    config: ConnectorClientConfig,
    terminal: Arc<T>,
    codec: EnvelopeCodec,
    event_tx: mpsc::Sender<ConnectorEvent>,
    cancel: CancellationToken,
}

impl<T: TerminalPort + ?Sized + 'static> ConnectorClient<T> {
    /// Create a client.
    #[must_use]
    pub const fn new(
        config: ConnectorClientConfig,
        terminal: Arc<T>,
        event_tx: mpsc::Sender<ConnectorEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            terminal,
            codec: EnvelopeCodec::new(),
            event_tx,
            cancel,
        }
    }

    /// Run the connection loop until cancelled, refused, or out of attempts.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorClientError::Refused`] when the bridge closes with
    /// a fatal code, or [`ConnectorClientError::ReconnectFailed`] once the
    /// supervisor gives up.
    pub async fn run(self: Arc<Self>) -> Result<(), ConnectorClientError> {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Connector client cancelled");
                return Ok(());
            }

            match self.connect_and_run(&mut attempt).await {
                Ok(()) => {
                    tracing::info!("Connector channel closed");
                    return Ok(());
                }
                Err(err @ ConnectorClientError::Refused { .. }) => {
                    tracing::error!(error = %err, "Bridge refused connector");
                    self.emit(ConnectorEvent::Disconnected {
                        reason: err.to_string(),
                    })
                    .await;
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Connector channel error");
                    self.emit(ConnectorEvent::Disconnected {
                        reason: err.to_string(),
                    })
                    .await;

                    attempt += 1;
                    if self.config.reconnect.should_give_up(attempt) {
                        let attempts = attempt - 1;
                        tracing::error!(attempts, "Giving up reconnecting to bridge");
                        self.emit(ConnectorEvent::ReconnectFailed { attempts }).await;
                        return Err(ConnectorClientError::ReconnectFailed { attempts });
                    }

                    let delay = self.config.reconnect.sleep_duration(attempt);
                    metrics::record_reconnect(attempt);
                    tracing::info!(attempt, delay_ms = delay.as_millis(), "Reconnecting to bridge");
                    self.emit(ConnectorEvent::Reconnecting { attempt, delay }).await;

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!("Connector client cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect and serve the channel until it drops or the client is cancelled.
    async fn connect_and_run(self: &Arc<Self>, attempt: &mut u32) -> Result<(), ConnectorClientError> {
        let endpoint = self.config.endpoint()?;
        let mut request = endpoint.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.token))
            .map_err(|e| ConnectorClientError::InvalidRequest(format!("token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        tracing::info!(
            url = %self.config.url,
            connection_id = %self.config.connection_id,
            "Connecting to bridge"
        );
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (mut write, mut read) = ws_stream.split();

        *attempt = 0;
        self.emit(ConnectorEvent::Connected).await;
        tracing::info!(connection_id = %self.config.connection_id, "Connected to bridge");

        let liveness = Arc::new(LivenessState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        let heartbeat_cancel = self.cancel.child_token();
        tokio::spawn(
            HeartbeatMonitor::new(
                self.config.heartbeat.clone(),
                Arc::clone(&liveness),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );
        let _stop_heartbeat = heartbeat_cancel.drop_guard();

        // Answers computed off the read loop are written here.
        let (reply_tx, mut reply_rx) = mpsc::channel::<Envelope>(64);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "shutdown".into(),
                    }))).await;
                    return Ok(());
                }
                heartbeat = heartbeat_rx.recv() => {
                    match heartbeat {
                        Some(HeartbeatEvent::SendPing) => {
                            write.send(Message::Ping(Vec::new().into())).await?;
                        }
                        Some(HeartbeatEvent::Silent { elapsed }) => {
                            return Err(ConnectorClientError::Silent(elapsed));
                        }
                        None => {
                            tracing::debug!("Heartbeat channel closed");
                        }
                    }
                }
                Some(reply) = reply_rx.recv() => {
                    let text = self.codec.encode(&reply)?;
                    write.send(Message::Text(text.into())).await?;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            liveness.record_traffic();
                            self.on_text(text.as_str(), &reply_tx).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            liveness.record_traffic();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            liveness.record_traffic();
                        }
                        Some(Ok(Message::Binary(data))) => {
                            tracing::warn!(len = data.len(), "Ignoring binary frame from bridge");
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(close_error(frame));
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(ConnectorClientError::ConnectionClosed),
                    }
                }
            }
        }
    }

    /// Decode a frame and queue its answer.
    async fn on_text(self: &Arc<Self>, text: &str, reply_tx: &mpsc::Sender<Envelope>) {
        let envelope = match self.codec.decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "Undecodable frame from bridge");
                let _ = reply_tx.send(decode_failure(&err)).await;
                return;
            }
        };

        // PING is answered inline; everything else may wait on the terminal.
        if let Envelope::Ping(_) = &envelope {
            if let Some(pong) = self.answer(envelope).await {
                let _ = reply_tx.send(pong).await;
            }
            return;
        }

        let this = Arc::clone(self);
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            if let Some(reply) = this.answer(envelope).await {
                if let Envelope::TradeResult(result) = &reply {
                    this.emit(ConnectorEvent::CommandExecuted {
                        correlation_id: result.correlation_id.clone(),
                        success: result.success,
                    })
                    .await;
                }
                let _ = reply_tx.send(reply).await;
            }
        });
    }

    /// Answer one envelope from the bridge, if it expects an answer.
    pub async fn answer(&self, envelope: Envelope) -> Option<Envelope> {
        match envelope {
            Envelope::Ping(ping) => Some(Envelope::Pong(PongPayload {
                timestamp: ping.timestamp,
                terminal_connected: Some(self.terminal.is_connected()),
                broker: self.terminal.broker().or_else(|| self.config.broker.clone()),
                account_id: self.config.account_id.clone(),
            })),
            Envelope::TradeOpen(command) => Some(self.execute(TradeAction::Open, command).await),
            Envelope::TradeClose(command) => Some(self.execute(TradeAction::Close, command).await),
            Envelope::TradeModify(command) => Some(self.execute(TradeAction::Modify, command).await),
            Envelope::SyncRequest(RequestPayload { correlation_id }) => {
                let positions = self.terminal.positions().await;
                let account = self.terminal.account().await;
                match (positions, account) {
                    (Ok(positions), Ok(account)) => Some(Envelope::SyncResponse(SyncResponsePayload {
                        account_id: self.config.account_id.clone(),
                        correlation_id,
                        positions,
                        account: Some(account),
                    })),
                    (Err(err), _) | (_, Err(err)) => {
                        tracing::warn!(error = %err, "Cannot answer sync request");
                        None
                    }
                }
            }
            Envelope::GetPositions(RequestPayload { correlation_id }) => match self.terminal.positions().await {
                Ok(positions) => Some(Envelope::Positions(PositionsPayload {
                    account_id: self.config.account_id.clone(),
                    correlation_id,
                    positions,
                })),
                Err(err) => {
                    tracing::warn!(error = %err, "Cannot answer positions request");
                    None
                }
            },
            Envelope::GetAccount(RequestPayload { correlation_id }) => match self.terminal.account().await {
                Ok(account) => Some(Envelope::AccountInfo(AccountInfoPayload {
                    account_id: self.config.account_id.clone(),
                    correlation_id,
                    balance: account.balance,
                    equity: account.equity,
                    margin: account.margin,
                    free_margin: account.free_margin,
                    currency: account.currency,
                })),
                Err(err) => {
                    tracing::warn!(error = %err, "Cannot answer account request");
                    None
                }
            },
            Envelope::Error(error) => {
                tracing::warn!(code = %error.code, message = %error.message, "Bridge reported an error");
                None
            }
            other => {
                tracing::debug!(kind = %other.kind(), "Ignoring envelope");
                None
            }
        }
    }

    async fn execute(&self, action: TradeAction, command: TradeCommandPayload) -> Envelope {
        let correlation_id = command.correlation_id.clone();
        tracing::info!(
            correlation_id = %correlation_id,
            intent_id = %command.intent_id,
            action = %action,
            "Executing trade command"
        );

        let outcome = match terminal_command(action, command) {
            Ok(command) => self.terminal.execute(command).await.map_err(|e| match e {
                TerminalError::Rejected(reason) => reason,
                other => other.to_string(),
            }),
            Err(reason) => Err(reason),
        };

        let (success, ticket, error) = match outcome {
            Ok(fill) => (true, Some(fill.ticket), None),
            Err(reason) => {
                tracing::warn!(correlation_id = %correlation_id, reason = %reason, "Trade command failed");
                (false, None, Some(reason))
            }
        };

        Envelope::TradeResult(TradeResultPayload {
            correlation_id,
            success,
            ticket,
            error,
            account_id: self.config.account_id.clone(),
        })
    }

    async fn emit(&self, event: ConnectorEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

/// Map a trade command to a terminal command.
fn terminal_command(action: TradeAction, command: TradeCommandPayload) -> Result<TerminalCommand, String> {
    match action {
        TradeAction::Open => {
            let (Some(instrument), Some(side), Some(size)) = (command.instrument, command.side, command.size) else {
                return Err("open requires instrument, side and size".to_string());
            };
            Ok(TerminalCommand::Open {
                instrument,
                side,
                size,
                stop_loss: command.stop_loss,
                take_profit: command.take_profit,
            })
        }
        TradeAction::Close => {
            let ticket = command.ticket.ok_or_else(|| "close requires a ticket".to_string())?;
            Ok(TerminalCommand::Close { ticket })
        }
        TradeAction::Modify => {
            let ticket = command.ticket.ok_or_else(|| "modify requires a ticket".to_string())?;
            Ok(TerminalCommand::Modify {
                ticket,
                stop_loss: command.stop_loss,
                take_profit: command.take_profit,
            })
        }
    }
}

/// `ERROR` answer for a frame the client could not decode.
fn decode_failure(err: &CodecError) -> Envelope {
    let code = if err.is_recoverable() {
        ErrorCode::UnknownType
    } else {
        ErrorCode::ProtocolViolation
    };
    Envelope::error(code, err.to_string(), None)
}

fn close_error(frame: Option<CloseFrame>) -> ConnectorClientError {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            tracing::info!(code, reason = frame.reason.as_str(), "Bridge closed channel");
            if FATAL_CLOSE_CODES.contains(&code) {
                ConnectorClientError::Refused {
                    code,
                    reason: frame.reason.as_str().to_string(),
                }
            } else {
                ConnectorClientError::ConnectionClosed
            }
        }
        None => ConnectorClientError::ConnectionClosed,
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::envelope::PingPayload;
    use crate::domain::identity::{IntentId, RemoteRef};
    use crate::domain::trade::Side;
    use crate::infrastructure::connector_client::PaperTerminal;

    fn client(terminal: PaperTerminal) -> ConnectorClient<PaperTerminal> {
        let (tx, _rx) = mpsc::channel(8);
        let mut config = ConnectorClientConfig::new("ws://localhost:1/ws/connector", "t", ConnectionId::new("c-1"));
        config.account_id = Some(AccountId::new("ACC-1"));
        ConnectorClient::new(config, Arc::new(terminal), tx, CancellationToken::new())
    }

    fn command(ticket: Option<&str>) -> TradeCommandPayload {
        TradeCommandPayload {
            correlation_id: CorrelationId::new("corr-1"),
            intent_id: IntentId::new("intent-1"),
            instrument: Some("EURUSD".into()),
            side: Some(Side::Buy),
            size: Some(dec!(0.1)),
            stop_loss: None,
            take_profit: None,
            ticket: ticket.map(RemoteRef::new),
        }
    }

    #[tokio::test]
    async fn unknown_type_is_answered_with_error() {
        let client = Arc::new(client(PaperTerminal::new(dec!(1000))));
        let (tx, mut rx) = mpsc::channel(4);

        client.on_text(r#"{"type":"TRADE_CANCEL"}"#, &tx).await;

        let Some(Envelope::Error(error)) = rx.recv().await else {
            panic!("expected ERROR envelope");
        };
        assert_eq!(error.code, ErrorCode::UnknownType);
        assert!(error.message.contains("TRADE_CANCEL"));
    }

    #[tokio::test]
    async fn malformed_frame_is_answered_with_error() {
        let client = Arc::new(client(PaperTerminal::new(dec!(1000))));
        let (tx, mut rx) = mpsc::channel(4);

        client.on_text("{not json", &tx).await;

        let Some(Envelope::Error(error)) = rx.recv().await else {
            panic!("expected ERROR envelope");
        };
        assert_eq!(error.code, ErrorCode::ProtocolViolation);
    }

    #[tokio::test]
    async fn answers_ping_with_terminal_status() {
        let client = client(PaperTerminal::new(dec!(1000)).with_broker("demo"));
        let reply = client
            .answer(Envelope::Ping(PingPayload { timestamp: Some(42) }))
            .await
            .unwrap();

        let Envelope::Pong(pong) = reply else {
            panic!("expected PONG, got {reply:?}");
        };
        assert_eq!(pong.timestamp, Some(42));
        assert_eq!(pong.terminal_connected, Some(true));
        assert_eq!(pong.broker.as_deref(), Some("demo"));
        assert_eq!(pong.account_id, Some(AccountId::new("ACC-1")));
    }

    #[tokio::test]
    async fn open_fills_with_ticket() {
        let client = client(PaperTerminal::new(dec!(10000)).with_next_ticket(555));
        let reply = client.answer(Envelope::TradeOpen(command(None))).await.unwrap();

        let Envelope::TradeResult(result) = reply else {
            panic!("expected TRADE_RESULT, got {reply:?}");
        };
        assert!(result.success);
        assert_eq!(result.ticket, Some(RemoteRef::new("555")));
        assert_eq!(result.correlation_id, CorrelationId::new("corr-1"));
    }

    #[tokio::test]
    async fn rejection_reason_is_passed_through() {
        let client = client(PaperTerminal::new(dec!(10)));
        let reply = client.answer(Envelope::TradeOpen(command(None))).await.unwrap();

        let Envelope::TradeResult(result) = reply else {
            panic!("expected TRADE_RESULT, got {reply:?}");
        };
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("insufficient margin"));
    }

    #[tokio::test]
    async fn close_without_ticket_fails_locally() {
        let client = client(PaperTerminal::new(dec!(10000)));
        let reply = client.answer(Envelope::TradeClose(command(None))).await.unwrap();

        let Envelope::TradeResult(result) = reply else {
            panic!("expected TRADE_RESULT, got {reply:?}");
        };
        assert!(!result.success);
        assert!(result.error.unwrap().contains("ticket"));
    }

    #[tokio::test]
    async fn sync_request_reports_positions_and_balances() {
        let client = client(PaperTerminal::new(dec!(10000)));
        client.answer(Envelope::TradeOpen(command(None))).await;

        let reply = client
            .answer(Envelope::SyncRequest(RequestPayload {
                correlation_id: Some(CorrelationId::new("sync-1")),
            }))
            .await
            .unwrap();
        let Envelope::SyncResponse(sync) = reply else {
            panic!("expected SYNC_RESPONSE, got {reply:?}");
        };
        assert_eq!(sync.positions.len(), 1);
        assert_eq!(sync.account.unwrap().balance, dec!(10000));
        assert_eq!(sync.correlation_id, Some(CorrelationId::new("sync-1")));
    }

    #[tokio::test]
    async fn offline_terminal_leaves_requests_unanswered() {
        let terminal = PaperTerminal::new(dec!(10000));
        terminal.set_connected(false);
        let client = client(terminal);

        assert!(client.answer(Envelope::GetAccount(RequestPayload::default())).await.is_none());
        assert!(client.answer(Envelope::GetPositions(RequestPayload::default())).await.is_none());
    }

    #[test]
    fn endpoint_carries_registration_query() {
        let mut config = ConnectorClientConfig::new("ws://bridge:8090/ws/connector", "t", ConnectionId::new("mt5 #1"));
        config.broker = Some("demo".into());

        let url = config.endpoint().unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("connection_id".to_string(), "mt5 #1".to_string()),
                ("broker".to_string(), "demo".to_string()),
            ]
        );
    }

    #[test]
    fn config_requires_url_token_and_connection() {
        let err = ConnectorClientConfig::from_lookup(&|_: &str| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "CONNECTOR_BRIDGE_URL"));

        let env = |key: &str| match key {
            "CONNECTOR_BRIDGE_URL" => Some("ws://bridge/ws/connector".to_string()),
            "CONNECTOR_TOKEN" => Some("  ".to_string()),
            _ => None,
        };
        let err = ConnectorClientConfig::from_lookup(&env).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(key) if key == "CONNECTOR_TOKEN"));
    }

    #[test]
    fn fatal_close_codes_stop_reconnecting() {
        let refused = close_error(Some(CloseFrame {
            code: CloseCode::from(4003),
            reason: "ownership_conflict".into(),
        }));
        assert!(matches!(refused, ConnectorClientError::Refused { code: 4003, .. }));

        let retry = close_error(Some(CloseFrame {
            code: CloseCode::from(4011),
            reason: "expired".into(),
        }));
        assert!(matches!(retry, ConnectorClientError::ConnectionClosed));
    }
}
