//! Scripted DTC server over an in-memory duplex stream.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

use super::codec::JsonFrameCodec;
use super::messages::{
    EncodingKind, EncodingResponse, HistoricalPriceDataRequest, LogonResponse, MarketDataRequest,
    MarketDataSnapshot, MarketDataUpdateTrade, Message, PROTOCOL_VERSION,
};
use super::session::{SessionClient, SessionConfig};
use crate::domain::market_data::SymbolId;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Server half of a duplex session.
pub struct TestServer {
    framed: Framed<DuplexStream, JsonFrameCodec>,
}

/// Client stream plus the server scripting it.
pub fn pair() -> (DuplexStream, TestServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (
        client,
        TestServer {
            framed: Framed::new(server, JsonFrameCodec::new()),
        },
    )
}

impl TestServer {
    /// Next non-heartbeat message from the client; `None` on close or timeout.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
                .await
                .ok()??;
            match frame {
                Ok(Ok(Message::Heartbeat(_))) => {}
                Ok(Ok(message)) => return Some(message),
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }

    pub async fn send(&mut self, message: Message) {
        self.framed.send(message).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed.get_mut().write_all(bytes).await.unwrap();
    }

    /// Accept JSON encoding and the logon.
    pub async fn handshake(&mut self) {
        match self.recv().await {
            Some(Message::EncodingRequest(request)) => {
                assert_eq!(request.encoding, EncodingKind::Json);
            }
            other => panic!("expected encoding request, got {other:?}"),
        }
        self.send(Message::EncodingResponse(EncodingResponse {
            protocol_version: PROTOCOL_VERSION,
            encoding: EncodingKind::Json,
            protocol_type: "DTC".to_string(),
        }))
        .await;
        match self.recv().await {
            Some(Message::LogonRequest(_)) => {}
            other => panic!("expected logon request, got {other:?}"),
        }
        self.send(logon_ok()).await;
    }

    pub async fn expect_subscribe(&mut self) -> MarketDataRequest {
        match self.recv().await {
            Some(Message::MarketDataRequest(request)) => request,
            other => panic!("expected market data request, got {other:?}"),
        }
    }

    pub async fn expect_historical(&mut self) -> HistoricalPriceDataRequest {
        match self.recv().await {
            Some(Message::HistoricalPriceDataRequest(request)) => request,
            other => panic!("expected historical request, got {other:?}"),
        }
    }
}

pub fn logon_ok() -> Message {
    Message::LogonResponse(LogonResponse {
        protocol_version: PROTOCOL_VERSION,
        result: 1,
        result_text: "Logon successful".to_string(),
        server_name: "Test DTC Server".to_string(),
        market_data_supported: true,
        historical_price_data_supported: true,
        security_definitions_supported: true,
        ..LogonResponse::default()
    })
}

pub fn snapshot(id: SymbolId, last: f64) -> Message {
    Message::MarketDataSnapshot(MarketDataSnapshot {
        symbol_id: id,
        last_trade_price: Some(last),
        bid_price: Some(last - 0.25),
        ask_price: Some(last + 0.25),
        ..MarketDataSnapshot::default()
    })
}

pub fn trade(id: SymbolId, price: f64) -> Message {
    Message::MarketDataUpdateTrade(MarketDataUpdateTrade {
        symbol_id: id,
        price,
        volume: 1.0,
        ..MarketDataUpdateTrade::default()
    })
}

/// Session logged on against a fresh scripted server.
pub async fn connected(config: SessionConfig) -> (SessionClient, TestServer) {
    let (client, mut server) = pair();
    let (session, ()) = tokio::join!(
        SessionClient::connect_stream(client, "test", config),
        server.handshake()
    );
    (session.unwrap(), server)
}
