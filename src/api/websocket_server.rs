//! WebSocket API Server
//!
//! リレーエンジンの出力を購読クライアントへリアルタイムで配信するWebSocketサーバー。
//!
//! ## 使用方法
//!
//! ```ignore
//! // サーバーを起動
//! let server = Arc::new(WebSocketServer::from_config(&config.server).with_tier_snapshot(relay.tier_snapshot()));
//! server.start().await?;
//!
//! // Broadcasterとしてリレーエンジンに渡す
//! let (relay, _task) = RelayEngine::spawn(config.engine, server.clone());
//!
//! // サーバーを停止
//! server.stop().await;
//! ```
//!
//! ## WebSocket API
//!
//! クライアントは `ws://localhost:8765` に接続してメッセージを受信できる。
//! メッセージはJSON形式で送信される。配信はベストエフォートで、
//! 受信が追いつかないクライアントは古いメッセージを読み飛ばす。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::analytics::tiers::TierAssignment;
use crate::config::ServerConfig;
use crate::models::OutboundMessage;
use crate::relay::{Broadcaster, TierSnapshot};

/// WebSocket接続のID
type ClientId = u64;

/// サーバーからクライアントへのメッセージ
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// リレーエンジンの出力
    Relay {
        session: String,
        message: OutboundMessage,
    },
    /// `GetTiers` への応答（セッションがなければ `tiers` は `None`）
    Tiers {
        session: String,
        tiers: Option<TierAssignment>,
    },
    /// 接続確認
    Connected { client_id: ClientId },
    /// サーバー情報
    ServerInfo {
        version: String,
        connected_clients: usize,
        sessions: Vec<String>,
    },
    /// エラー
    Error { message: String },
}

/// クライアントからサーバーへのメッセージ
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Ping
    Ping,
    /// サーバー情報をリクエスト
    GetInfo,
    /// セッションの最新ティアをリクエスト
    GetTiers { session: String },
}

/// WebSocketサーバーの状態
#[derive(Debug, Clone, PartialEq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// 希望ポートが使用中のとき追加で試すポート数
const PORT_PROBE_RANGE: u16 = 9;

type Clients = Arc<RwLock<HashMap<ClientId, mpsc::UnboundedSender<Message>>>>;

/// WebSocketサーバー
pub struct WebSocketServer {
    /// 希望ポート（開始ポート）
    preferred_port: u16,
    /// 実際に使用中のポート
    actual_port: Arc<RwLock<Option<u16>>>,
    state: Arc<RwLock<ServerState>>,
    clients: Clients,
    message_tx: broadcast::Sender<ServerMessage>,
    tiers: TierSnapshot,
    next_client_id: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl WebSocketServer {
    /// 新しいWebSocketサーバーを作成
    ///
    /// `port`は希望するポート番号。サーバー起動時にこのポートが使用中の場合、
    /// 自動的に次のポート番号を試行する。
    pub fn new(port: u16) -> Self {
        Self::with_buffer(port, ServerConfig::default().broadcast_buffer)
    }

    /// 設定からサーバーを作成
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::with_buffer(config.port, config.broadcast_buffer)
    }

    fn with_buffer(port: u16, buffer: usize) -> Self {
        let (message_tx, _) = broadcast::channel(buffer.max(1));
        Self {
            preferred_port: port,
            actual_port: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            clients: Arc::new(RwLock::new(HashMap::new())),
            message_tx,
            tiers: TierSnapshot::default(),
            next_client_id: Arc::new(AtomicU64::new(1)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `GetTiers` で参照するスナップショットを設定
    pub fn with_tier_snapshot(mut self, tiers: TierSnapshot) -> Self {
        self.tiers = tiers;
        self
    }

    /// サーバーを起動
    ///
    /// 希望ポートが使用中の場合、自動的に次のポート（最大10ポート）を試行する。
    pub async fn start(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                tracing::warn!("WebSocket server is already in state: {:?}", *state);
                return Err(anyhow::anyhow!("Server is already running or starting"));
            }
            *state = ServerState::Starting;
        }

        self.shutdown.store(false, Ordering::SeqCst);

        // ポートを順番に試行
        let port_range_end = self.preferred_port.saturating_add(PORT_PROBE_RANGE);
        let (listener, bound_port) = self
            .try_bind_ports(self.preferred_port, port_range_end)
            .await?;

        // 実際に使用するポートを記録
        {
            let mut actual = self.actual_port.write().await;
            *actual = Some(bound_port);
        }

        let addr = format!("127.0.0.1:{}", bound_port);
        if bound_port != self.preferred_port {
            tracing::info!(
                "🌐 WebSocket server listening on ws://{} (preferred port {} was unavailable)",
                addr,
                self.preferred_port
            );
        } else {
            tracing::info!("🌐 WebSocket server listening on ws://{}", addr);
        }

        {
            let mut state = self.state.write().await;
            *state = ServerState::Running;
        }

        let clients = Arc::clone(&self.clients);
        let message_tx = self.message_tx.clone();
        let tiers = Arc::clone(&self.tiers);
        let next_client_id = Arc::clone(&self.next_client_id);
        let shutdown = Arc::clone(&self.shutdown);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            while !shutdown.load(Ordering::SeqCst) {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let client_id = next_client_id.fetch_add(1, Ordering::SeqCst);
                                tracing::info!(
                                    "📥 New WebSocket connection from {} (client_id: {})",
                                    addr,
                                    client_id
                                );

                                let clients = Arc::clone(&clients);
                                let tiers = Arc::clone(&tiers);
                                let message_rx = message_tx.subscribe();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(
                                        stream, addr, client_id, clients, tiers, message_rx,
                                    )
                                    .await
                                    {
                                        tracing::warn!(
                                            "WebSocket connection error for client {}: {}",
                                            client_id,
                                            e
                                        );
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {
                        // Check shutdown flag periodically
                    }
                }
            }

            let mut state_guard = state.write().await;
            *state_guard = ServerState::Stopped;
            tracing::info!("🛑 WebSocket server stopped");
        });

        Ok(())
    }

    /// 指定範囲のポートを順番に試行してバインド
    async fn try_bind_ports(
        &self,
        start_port: u16,
        end_port: u16,
    ) -> anyhow::Result<(TcpListener, u16)> {
        let mut last_error = None;

        for port in start_port..=end_port {
            let addr = format!("127.0.0.1:{}", port);
            tracing::debug!("Attempting to bind WebSocket server to {}", addr);

            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::debug!("Successfully bound to {}", addr);
                    return Ok((listener, port));
                }
                Err(e) => {
                    tracing::debug!("Port {} unavailable: {}", port, e);
                    last_error = Some(e);
                }
            }
        }

        // すべてのポートが使用中
        let err = last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "No ports available")
        });
        tracing::error!(
            "❌ Failed to bind WebSocket server to any port in range {}-{}: {}",
            start_port,
            end_port,
            err
        );

        let mut state = self.state.write().await;
        *state = ServerState::Stopped;

        Err(anyhow::anyhow!(
            "Failed to bind to any port in range {}-{}: {}",
            start_port,
            end_port,
            err
        ))
    }

    /// サーバーを停止
    pub async fn stop(&self) {
        tracing::info!("🛑 Stopping WebSocket server...");

        {
            let mut state = self.state.write().await;
            *state = ServerState::Stopping;
        }

        self.shutdown.store(true, Ordering::SeqCst);

        // 実際に使用中のポートをクリア
        {
            let mut actual = self.actual_port.write().await;
            *actual = None;
        }

        // すべてのクライアントにCloseを送って切断
        let mut clients = self.clients.write().await;
        for sender in clients.values() {
            let _ = sender.send(Message::Close(None));
        }
        clients.clear();
    }

    /// リレーメッセージを全クライアントにブロードキャスト
    pub fn broadcast_relay(&self, session: &str, message: &OutboundMessage) {
        let server_msg = ServerMessage::Relay {
            session: session.to_string(),
            message: message.clone(),
        };

        if let Err(e) = self.message_tx.send(server_msg) {
            tracing::trace!("No active subscribers for broadcast: {}", e);
        }
    }

    /// 接続中のクライアント数を取得
    pub async fn connected_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    /// サーバーの状態を取得
    pub async fn get_state(&self) -> ServerState {
        self.state.read().await.clone()
    }

    /// サーバーが実行中かどうか
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == ServerState::Running
    }

    /// 希望ポート番号を取得
    pub fn preferred_port(&self) -> u16 {
        self.preferred_port
    }

    /// 実際に使用中のポート番号を取得
    ///
    /// サーバーが起動していない場合はNoneを返す
    pub async fn actual_port(&self) -> Option<u16> {
        *self.actual_port.read().await
    }
}

#[async_trait]
impl Broadcaster for WebSocketServer {
    async fn broadcast(&self, session: &str, message: &OutboundMessage) {
        self.broadcast_relay(session, message);
    }
}

/// クライアントのリクエストに対する応答を作る。PingはWebSocketのPongで返すため `None`
async fn respond(
    request: ClientMessage,
    clients: &Clients,
    tiers: &TierSnapshot,
) -> Option<ServerMessage> {
    match request {
        ClientMessage::Ping => None,
        ClientMessage::GetInfo => {
            let connected_clients = clients.read().await.len();
            let mut sessions: Vec<String> = tiers.read().keys().cloned().collect();
            sessions.sort();
            Some(ServerMessage::ServerInfo {
                version: env!("CARGO_PKG_VERSION").to_string(),
                connected_clients,
                sessions,
            })
        }
        ClientMessage::GetTiers { session } => {
            let snapshot = tiers.read().get(&session).cloned();
            Some(ServerMessage::Tiers {
                session,
                tiers: snapshot,
            })
        }
    }
}

/// WebSocket接続を処理
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    client_id: ClientId,
    clients: Clients,
    tiers: TierSnapshot,
    mut message_rx: broadcast::Receiver<ServerMessage>,
) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    // クライアント用の送信チャネルを作成
    let (tx, mut rx) = mpsc::unbounded_channel();

    // クライアントを登録
    {
        let mut clients_guard = clients.write().await;
        clients_guard.insert(client_id, tx);
    }

    // 接続確認メッセージを送信
    let connected_msg = ServerMessage::Connected { client_id };
    let json = serde_json::to_string(&connected_msg)?;
    write.send(Message::Text(json)).await?;

    tracing::info!("✅ Client {} connected from {}", client_id, addr);

    loop {
        tokio::select! {
            // クライアントからのメッセージを処理
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Ping) => {
                                write.send(Message::Pong(vec![])).await?;
                                continue;
                            }
                            Ok(request) => respond(request, &clients, &tiers).await,
                            Err(e) => Some(ServerMessage::Error {
                                message: format!("Invalid request: {}", e),
                            }),
                        };
                        if let Some(reply) = reply {
                            let json = serde_json::to_string(&reply)?;
                            write.send(Message::Text(json)).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("📤 Client {} disconnected", client_id);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error for client {}: {}", client_id, e);
                        break;
                    }
                    _ => {}
                }
            }

            // ブロードキャストメッセージを受信
            msg = message_rx.recv() => {
                match msg {
                    Ok(server_msg) => {
                        let json = serde_json::to_string(&server_msg)?;
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(
                            "Client {} lagged behind, skipped {} messages",
                            client_id,
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            // 直接送信キューからのメッセージ（停止時のClose）
            msg = rx.recv() => {
                match msg {
                    Some(message) => {
                        let closing = matches!(message, Message::Close(_));
                        if write.send(message).await.is_err() || closing {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // クライアントを削除
    {
        let mut clients_guard = clients.write().await;
        clients_guard.remove(&client_id);
    }

    Ok(())
}
