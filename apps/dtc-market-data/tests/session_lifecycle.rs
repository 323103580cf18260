//! Session lifecycle over real TCP sockets.
//!
//! A scripted DTC server on `127.0.0.1:0` drives the client through logon,
//! subscription, historical requests, disconnects and logoff.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use dtc_market_data::domain::historical::HistoricalEvent;
use dtc_market_data::infrastructure::dtc::messages::{
    EncodingKind, EncodingResponse, HistoricalPriceDataRecordResponse, HistoricalPriceDataRequest,
    HistoricalPriceDataResponseHeader, LogonResponse, Logoff, MarketDataRequest,
    MarketDataSnapshot, MarketDataUpdateTrade, Message, PROTOCOL_VERSION, RequestAction,
};
use dtc_market_data::infrastructure::dtc::{JsonFrameCodec, ReconnectError, SubscriptionOutcome};
use dtc_market_data::{
    HistoricalQuery, PriceHub, PriceUpdateKind, ReconnectConfig, ReconnectSupervisor,
    SessionClient, SessionConfig, SessionState, SubscriptionKey, SupervisorEvent, TcpConnector,
};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

const STEP: Duration = Duration::from_secs(5);

// =============================================================================
// Scripted server
// =============================================================================

struct Peer {
    framed: Framed<TcpStream, JsonFrameCodec>,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(STEP, listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        Self {
            framed: Framed::new(stream, JsonFrameCodec::new()),
        }
    }

    async fn recv(&mut self) -> Message {
        loop {
            let frame = tokio::time::timeout(STEP, self.framed.next())
                .await
                .expect("client went quiet")
                .expect("client hung up")
                .unwrap()
                .unwrap();
            if !matches!(frame, Message::Heartbeat(_)) {
                return frame;
            }
        }
    }

    async fn send(&mut self, message: Message) {
        self.framed.send(message).await.unwrap();
    }

    async fn handshake(&mut self, server_name: &str) {
        assert!(matches!(self.recv().await, Message::EncodingRequest(_)));
        self.send(Message::EncodingResponse(EncodingResponse {
            protocol_version: PROTOCOL_VERSION,
            encoding: EncodingKind::Json,
            protocol_type: "DTC".to_string(),
        }))
        .await;
        match self.recv().await {
            Message::LogonRequest(request) => assert_eq!(request.protocol_version, PROTOCOL_VERSION),
            other => panic!("expected logon request, got {other:?}"),
        }
        self.send(Message::LogonResponse(LogonResponse {
            protocol_version: PROTOCOL_VERSION,
            result: 1,
            result_text: "Logon successful".to_string(),
            server_name: server_name.to_string(),
            market_data_supported: true,
            historical_price_data_supported: true,
            ..LogonResponse::default()
        }))
        .await;
    }

    async fn expect_subscribe(&mut self) -> MarketDataRequest {
        match self.recv().await {
            Message::MarketDataRequest(request) => {
                assert_eq!(request.request_action, RequestAction::Subscribe);
                request
            }
            other => panic!("expected market data request, got {other:?}"),
        }
    }

    async fn expect_historical(&mut self) -> HistoricalPriceDataRequest {
        match self.recv().await {
            Message::HistoricalPriceDataRequest(request) => request,
            other => panic!("expected historical request, got {other:?}"),
        }
    }

    async fn snapshot(&mut self, symbol_id: u32, last: f64) {
        self.send(Message::MarketDataSnapshot(MarketDataSnapshot {
            symbol_id,
            last_trade_price: Some(last),
            bid_price: Some(last - 0.25),
            ask_price: Some(last + 0.25),
            ..MarketDataSnapshot::default()
        }))
        .await;
    }

    async fn trade(&mut self, symbol_id: u32, price: f64) {
        self.send(Message::MarketDataUpdateTrade(MarketDataUpdateTrade {
            symbol_id,
            price,
            volume: 2.0,
            ..MarketDataUpdateTrade::default()
        }))
        .await;
    }
}

async fn listen() -> (TcpListener, TcpConnector) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, TcpConnector::new("127.0.0.1", port))
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter_factor: 0.0,
        ..ReconnectConfig::default()
    }
}

fn es() -> SubscriptionKey {
    SubscriptionKey::new("ESZ25", "CME")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn logon_subscribe_and_stream_over_tcp() {
    let (listener, connector) = listen().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.handshake("Scripted").await;
        let request = peer.expect_subscribe().await;
        assert_eq!(request.symbol, "ESZ25");
        assert_eq!(request.exchange, "CME");
        peer.snapshot(request.symbol_id, 6000.0).await;
        peer.trade(request.symbol_id, 6000.5).await;
        peer
    });

    let session = SessionClient::connect(&connector, SessionConfig::default())
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.capabilities().server_name, "Scripted");

    let mut handle = session.subscribe(es()).await.unwrap();
    match handle.outcome().await {
        SubscriptionOutcome::Active(snapshot) => assert_eq!(snapshot.last_price, Some(6000.0)),
        other => panic!("expected active subscription, got {other:?}"),
    }

    let first = handle.next_update().await.unwrap();
    assert!(matches!(first.kind, PriceUpdateKind::Snapshot(_)));
    let second = handle.next_update().await.unwrap();
    assert!(matches!(second.kind, PriceUpdateKind::Delta(_)));
    assert_eq!(second.last_price(), Some(6000.5));

    let _peer = server.await.unwrap();
    session.close();
}

#[tokio::test]
async fn historical_bars_over_tcp() {
    let (listener, connector) = listen().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.handshake("Scripted").await;
        let request = peer.expect_historical().await;
        assert_eq!(request.symbol, "ESZ25");
        peer.send(Message::HistoricalPriceDataResponseHeader(
            HistoricalPriceDataResponseHeader {
                request_id: request.request_id,
                record_interval: request.record_interval,
                ..HistoricalPriceDataResponseHeader::default()
            },
        ))
        .await;
        for (i, close) in [100.0, 101.0, 102.0].into_iter().enumerate() {
            peer.send(Message::HistoricalPriceDataRecordResponse(
                HistoricalPriceDataRecordResponse {
                    request_id: request.request_id,
                    start_date_time: 45_658.0 + f64::from(u8::try_from(i).unwrap()),
                    open_price: close,
                    high_price: close + 1.0,
                    low_price: close - 1.0,
                    last_price: close,
                    volume: 10.0,
                    is_final_record: i == 2,
                    ..HistoricalPriceDataRecordResponse::default()
                },
            ))
            .await;
        }
        peer
    });

    let session = SessionClient::connect(&connector, SessionConfig::default())
        .await
        .unwrap();
    let query = HistoricalQuery::new(
        es(),
        86_400,
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap(),
        None,
    );
    let mut stream = session
        .fetch_historical(query, Some(STEP))
        .await
        .unwrap();

    let mut closes = Vec::new();
    loop {
        match stream.next().await.unwrap() {
            HistoricalEvent::Record(record) => closes.push(record.close),
            HistoricalEvent::Complete { records } => {
                assert_eq!(records, 3);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(closes, vec![100.0, 101.0, 102.0]);
    assert_eq!(session.historical_in_flight(), 0);

    let _peer = server.await.unwrap();
    session.close();
}

#[tokio::test]
async fn supervisor_resubscribes_after_server_drop() {
    let (listener, connector) = listen().await;
    let server = tokio::spawn(async move {
        let mut first = Peer::accept(&listener).await;
        first.handshake("First").await;
        let request = first.expect_subscribe().await;
        first.snapshot(request.symbol_id, 6000.0).await;
        first.trade(request.symbol_id, 6001.0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);

        let mut second = Peer::accept(&listener).await;
        second.handshake("Second").await;
        let request = second.expect_subscribe().await;
        assert_eq!(request.symbol, "ESZ25");
        second.snapshot(request.symbol_id, 6010.0).await;
        second
    });

    let supervisor = ReconnectSupervisor::new(
        Arc::new(connector),
        SessionConfig::default(),
        fast_reconnect(),
        Arc::new(PriceHub::default()),
    );
    let mut events = supervisor.events();
    let handle = supervisor.spawn([es()]);
    let mut prices = handle.subscribe(es());

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let update = tokio::time::timeout(STEP, prices.recv())
            .await
            .unwrap()
            .unwrap();
        if let Some(price) = update.last_price() {
            seen.push(price);
        }
    }
    assert_eq!(seen, vec![6000.0, 6001.0, 6010.0]);

    let mut connected = Vec::new();
    while connected.len() < 2 {
        if let SupervisorEvent::Connected { server_name } =
            tokio::time::timeout(STEP, events.recv()).await.unwrap().unwrap()
        {
            connected.push(server_name);
        }
    }
    assert_eq!(connected, vec!["First".to_string(), "Second".to_string()]);
    assert_eq!(handle.status().reconnects, 1);

    let _peer = server.await.unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn logoff_with_do_not_reconnect_stops_the_supervisor() {
    let (listener, connector) = listen().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.handshake("Scripted").await;
        peer.send(Message::Logoff(Logoff {
            reason: "maintenance".to_string(),
            do_not_reconnect: true,
        }))
        .await;
        peer
    });

    let handle = ReconnectSupervisor::new(
        Arc::new(connector),
        SessionConfig::default(),
        fast_reconnect(),
        Arc::new(PriceHub::default()),
    )
    .spawn([]);

    let result = tokio::time::timeout(STEP, handle.join()).await.unwrap();
    assert!(matches!(
        result,
        Err(ReconnectError::ServerRequestedNoReconnect(reason)) if reason == "maintenance"
    ));
    assert!(handle.status().stopped);

    let _peer = server.await.unwrap();
}
