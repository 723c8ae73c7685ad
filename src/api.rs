pub mod websocket_server; // 購読クライアントへの配信

pub use websocket_server::{ClientMessage, ServerMessage, ServerState, WebSocketServer};
