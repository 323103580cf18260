//! Application Services
//!
//! [`MarketDataService`] is the entry point collaborators use for prices:
//!
//! - `subscribe` returns a broadcast receiver that keeps delivering across
//!   reconnects and source changes
//! - a refused subscription that no tick file serves ends with one
//!   [`PriceUpdateKind::Rejected`] update, after which the receiver closes
//! - `fetch_historical` streams bars from the live (or dedicated historical)
//!   session
//! - `tick_file_inventory` and `recent_ticks` read the local tick files
//!   directly
//!
//! # Fallback
//!
//! When the server rejects a subscription for entitlement reasons (or for
//! any reason, if configured) and a tick data directory is set, the service
//! tails `<data_dir>/<SYMBOL>.scid` and publishes its records as
//! [`PriceUpdateKind::Bar`] on the same channel. The same happens for every
//! wanted symbol if the reconnect supervisor gives up.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{GatewayStatus, StatusProvider};
use crate::domain::historical::HistoricalQuery;
use crate::domain::market_data::{PriceSource, PriceUpdate, PriceUpdateKind, SubscriptionKey, TickRecord};
use crate::domain::subscription::{RejectCategory, SubscriptionRejection};
use crate::infrastructure::dtc::historical::HistoricalStream;
use crate::infrastructure::dtc::messages::SecurityDefinitionResponse;
use crate::infrastructure::dtc::reconnect::{SHUTDOWN_REASON, SupervisorEvent, SupervisorHandle};
use crate::infrastructure::dtc::session::SessionError;
use crate::infrastructure::hub::PriceHub;
use crate::infrastructure::scid::decoder::TickFileError;
use crate::infrastructure::scid::inventory::TickFileSummary;
use crate::infrastructure::scid::reader::TickFileReader;
use crate::infrastructure::scid::tailer::{
    LiveFileTailer, TailEvent, TailerConfig, TailerControl, tick_file_path,
};

/// Default timeout applied to historical fetches.
pub const DEFAULT_HISTORICAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Service settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Timeout for historical fetches that do not give one.
    pub historical_timeout: Duration,
    /// Directory of tick files (`None` = no fallback).
    pub data_dir: Option<PathBuf>,
    /// Fall back on every reject, not only entitlement rejects.
    pub fallback_on_any_reject: bool,
    /// Tailer settings for fallback sources.
    pub tailer: TailerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            historical_timeout: DEFAULT_HISTORICAL_TIMEOUT,
            data_dir: None,
            fallback_on_any_reject: false,
            tailer: TailerConfig::default(),
        }
    }
}

/// Service errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// No session is logged on right now.
    #[error("not connected to the DTC server")]
    NotConnected,

    /// The session refused or dropped the request.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// No tick data directory is configured.
    #[error("no tick file directory configured")]
    NoDataDir,

    /// A tick file or the data directory could not be read.
    #[error(transparent)]
    TickFile(#[from] TickFileError),
}

/// Market data facade over the reconnect supervisor and tick file tailers.
pub struct MarketDataService {
    config: ServiceConfig,
    hub: Arc<PriceHub>,
    live: SupervisorHandle,
    historical: Option<SupervisorHandle>,
    tailers: Mutex<HashMap<SubscriptionKey, TailerControl>>,
    declined: Mutex<HashSet<SubscriptionKey>>,
    cancel: CancellationToken,
}

impl MarketDataService {
    /// Start the service on top of a running supervisor.
    ///
    /// `historical` is a second supervisor used only for historical
    /// requests; without it they go over the live session.
    #[must_use]
    pub fn start(
        config: ServiceConfig,
        live: SupervisorHandle,
        historical: Option<SupervisorHandle>,
    ) -> Arc<Self> {
        let events = live.events();
        let service = Arc::new(Self {
            config,
            hub: live.hub().clone(),
            live,
            historical,
            tailers: Mutex::new(HashMap::new()),
            declined: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(watch_supervisor(
            Arc::downgrade(&service),
            events,
            service.cancel.clone(),
        ));
        service
    }

    /// Receive updates for `symbol` on `exchange`.
    #[must_use]
    pub fn subscribe(
        &self,
        symbol: impl Into<String>,
        exchange: impl Into<String>,
    ) -> broadcast::Receiver<PriceUpdate> {
        self.subscribe_key(SubscriptionKey::new(symbol, exchange))
    }

    /// Receive updates for `key`.
    ///
    /// If the server refuses `key` and no tick file takes over, the
    /// receiver gets [`PriceUpdateKind::Rejected`] and then closes.
    #[must_use]
    pub fn subscribe_key(&self, key: SubscriptionKey) -> broadcast::Receiver<PriceUpdate> {
        self.declined.lock().remove(&key);
        if self.tailers.lock().contains_key(&key) {
            tracing::debug!(symbol = %key, "Joining tick file source");
            return self.hub.subscribe(&key);
        }
        self.live.subscribe(key)
    }

    /// Stop the protocol subscription and any tick file source for `key`.
    pub fn unsubscribe(&self, key: &SubscriptionKey) {
        self.live.unsubscribe(key.clone());
        self.declined.lock().remove(key);
        if let Some(control) = self.tailers.lock().remove(key) {
            control.stop();
        }
    }

    /// Fetch historical bars.
    ///
    /// `timeout` defaults to [`ServiceConfig::historical_timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotConnected`] while no session is logged on,
    /// or the session error that refused the request.
    pub async fn fetch_historical(
        &self,
        query: HistoricalQuery,
        timeout: Option<Duration>,
    ) -> Result<HistoricalStream, ServiceError> {
        let session = self
            .historical
            .as_ref()
            .unwrap_or(&self.live)
            .session()
            .ok_or(ServiceError::NotConnected)?;
        let timeout = timeout.unwrap_or(self.config.historical_timeout);
        Ok(session.fetch_historical(query, Some(timeout)).await?)
    }

    /// Look up the server's definition of `key`.
    ///
    /// # Errors
    ///
    /// Same as [`MarketDataService::fetch_historical`].
    pub async fn security_definition(
        &self,
        key: &SubscriptionKey,
    ) -> Result<SecurityDefinitionResponse, ServiceError> {
        let session = self.live.session().ok_or(ServiceError::NotConnected)?;
        Ok(session.security_definition(key).await?)
    }

    /// Summaries of every tick file in the data directory, sorted by symbol.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NoDataDir`] without a data directory, or
    /// [`ServiceError::TickFile`] when it cannot be listed.
    pub async fn tick_file_inventory(&self) -> Result<Vec<TickFileSummary>, ServiceError> {
        let dir = self.config.data_dir.as_ref().ok_or(ServiceError::NoDataDir)?;
        Ok(self.tick_file_reader().scan_directory(dir).await?)
    }

    /// Up to `count` of the newest records in the tick file for `key`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NoDataDir`] without a data directory, or
    /// [`ServiceError::TickFile`] when the file cannot be read.
    pub async fn recent_ticks(
        &self,
        key: &SubscriptionKey,
        count: usize,
    ) -> Result<Vec<TickRecord>, ServiceError> {
        let dir = self.config.data_dir.as_ref().ok_or(ServiceError::NoDataDir)?;
        let path = tick_file_path(dir, &key.symbol);
        Ok(self.tick_file_reader().read_recent(&path, count).await?)
    }

    const fn tick_file_reader(&self) -> TickFileReader {
        TickFileReader::new(self.config.tailer.decoder)
    }

    /// Keys served from tick files, sorted.
    #[must_use]
    pub fn tick_file_sources(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self.tailers.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Latest record of the tick file backing `key`.
    #[must_use]
    pub fn last_tick(&self, key: &SubscriptionKey) -> Option<TickRecord> {
        self.tailers.lock().get(key).and_then(TailerControl::last_record)
    }

    /// Hub all updates are published into.
    #[must_use]
    pub const fn hub(&self) -> &Arc<PriceHub> {
        &self.hub
    }

    /// Stop tailers and log off.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for (_, control) in self.tailers.lock().drain() {
            control.stop();
        }
        if let Some(historical) = &self.historical
            && let Err(e) = historical.shutdown().await
        {
            tracing::debug!(error = %e, "Historical supervisor already stopped");
        }
        if let Err(e) = self.live.shutdown().await {
            tracing::debug!(error = %e, "Supervisor already stopped");
        }
    }

    const fn should_fall_back(&self, rejection: &SubscriptionRejection) -> bool {
        self.config.fallback_on_any_reject
            || matches!(rejection.category, RejectCategory::Entitlement)
    }

    /// Report `rejection` on the key's channel and close it.
    fn decline(&self, key: SubscriptionKey, rejection: SubscriptionRejection) {
        tracing::warn!(symbol = %key, rejection = %rejection, "Subscription rejected");
        self.declined.lock().insert(key.clone());
        let _ = self.hub.publish(PriceUpdate::now(
            key.clone(),
            PriceSource::Protocol,
            PriceUpdateKind::Rejected(rejection),
        ));
        self.hub.remove(&key);
    }

    fn is_declined(&self, key: &SubscriptionKey) -> bool {
        self.declined.lock().contains(key)
    }

    /// Serve `key` from its tick file. Returns `false` if no data directory
    /// is configured or a tailer already runs.
    pub fn start_tick_file_source(&self, key: &SubscriptionKey) -> bool {
        let Some(dir) = &self.config.data_dir else {
            return false;
        };
        let mut tailers = self.tailers.lock();
        if tailers.contains_key(key) {
            return false;
        }

        let path = tick_file_path(dir, &key.symbol);
        tracing::info!(symbol = %key, path = %path.display(), "Falling back to tick file");
        let mut handle = LiveFileTailer::new(path, self.config.tailer).spawn();
        tailers.insert(key.clone(), handle.control());
        drop(tailers);

        let hub = self.hub.clone();
        let key = key.clone();
        tokio::spawn(async move {
            while let Some(event) = handle.recv().await {
                if let TailEvent::Record(record) = event {
                    let update =
                        PriceUpdate::now(key.clone(), PriceSource::TickFile, PriceUpdateKind::Bar(record));
                    let _ = hub.publish(update);
                }
            }
            tracing::debug!(symbol = %key, "Tick file source ended");
        });
        true
    }
}

impl StatusProvider for MarketDataService {
    fn gateway_status(&self) -> GatewayStatus {
        let status = self.live.status();
        GatewayStatus {
            session_state: status.state,
            server_name: status.capabilities.map(|c| c.server_name),
            reconnect_attempts: status.attempts,
            reconnects: status.reconnects,
            subscriptions: status.subscriptions,
            tailers: self.tailers.lock().len(),
            supervisor_stopped: status.stopped,
            last_error: status.last_error,
        }
    }
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataService")
            .field("config", &self.config)
            .field("tailers", &self.tailers.lock().len())
            .finish_non_exhaustive()
    }
}

async fn watch_supervisor(
    service: Weak<MarketDataService>,
    mut events: broadcast::Receiver<SupervisorEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Supervisor events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(service) = service.upgrade() else {
            return;
        };

        match event {
            SupervisorEvent::SubscriptionRejected { key, rejection } => {
                let served = service.should_fall_back(&rejection)
                    && (service.start_tick_file_source(&key)
                        || service.tailers.lock().contains_key(&key));
                if !served {
                    service.decline(key, rejection);
                }
            }
            SupervisorEvent::Stopped { reason } if reason == SHUTDOWN_REASON => return,
            SupervisorEvent::Stopped { reason } => {
                tracing::warn!(reason = %reason, "Live data unavailable");
                for key in service.hub.keys() {
                    if !service.is_declined(&key) {
                        service.start_tick_file_source(&key);
                    }
                }
            }
            SupervisorEvent::Connected { server_name } => {
                tracing::info!(server = %server_name, "Live data connected");
            }
            SupervisorEvent::Disconnected { .. } | SupervisorEvent::Reconnecting { .. } => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::application::ports::{ConnectionError, QueuedConnector};
    use crate::domain::time::TimeEncoding;
    use crate::infrastructure::dtc::messages::{
        HistoricalPriceDataRecordResponse, HistoricalPriceDataResponseHeader, Logoff,
        MarketDataReject, Message,
    };
    use crate::infrastructure::dtc::reconnect::{ReconnectConfig, ReconnectSupervisor};
    use crate::infrastructure::dtc::session::{SessionConfig, SessionState};
    use crate::infrastructure::dtc::test_server::{TestServer, pair, snapshot};
    use crate::infrastructure::scid::decoder::{TickFileHeader, encode_record};
    use crate::infrastructure::scid::tailer::StartPosition;

    fn fast() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
            ..ReconnectConfig::default()
        }
    }

    fn bar(close: f64) -> TickRecord {
        TickRecord {
            timestamp: Utc.with_ymd_and_hms(2025, 4, 2, 15, 0, 0).single().unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            num_trades: 1,
            total_volume: 2,
            bid_volume: 1,
            ask_volume: 1,
        }
    }

    fn tick_dir(symbol: &str, closes: &[f64]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = TickFileHeader::default().encode().to_vec();
        for close in closes {
            bytes.extend_from_slice(&encode_record(&bar(*close), TimeEncoding::Microseconds));
        }
        std::fs::write(tick_file_path(dir.path(), symbol), bytes).unwrap();
        dir
    }

    fn service_config(dir: &TempDir, any: bool) -> ServiceConfig {
        ServiceConfig {
            data_dir: Some(dir.path().to_path_buf()),
            fallback_on_any_reject: any,
            tailer: TailerConfig {
                poll_interval: Duration::from_millis(10),
                start: StartPosition::Beginning,
                ..TailerConfig::default()
            },
            ..ServiceConfig::default()
        }
    }

    fn rejecting_server(text: &'static str) -> (Arc<QueuedConnector>, tokio::task::JoinHandle<TestServer>) {
        let connector = Arc::new(QueuedConnector::new());
        let (client, mut server) = pair();
        connector.push_stream(client);
        let script = tokio::spawn(async move {
            server.handshake().await;
            let request = server.expect_subscribe().await;
            server
                .send(Message::MarketDataReject(MarketDataReject {
                    symbol_id: request.symbol_id,
                    reject_text: text.to_string(),
                }))
                .await;
            server
        });
        (connector, script)
    }

    fn supervisor(connector: Arc<QueuedConnector>) -> ReconnectSupervisor {
        ReconnectSupervisor::new(
            connector,
            SessionConfig::default(),
            fast(),
            Arc::new(PriceHub::default()),
        )
    }

    #[tokio::test]
    async fn entitlement_reject_falls_back_to_tick_file() {
        let dir = tick_dir("ESZ25", &[5000.0, 5001.0]);
        let (connector, script) = rejecting_server("");
        let handle = supervisor(connector).spawn([]);
        let service = MarketDataService::start(service_config(&dir, false), handle, None);

        let mut rx = service.subscribe("ESZ25", "CME");
        let mut closes = Vec::new();
        for _ in 0..2 {
            let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(update.source, PriceSource::TickFile);
            closes.push(update.last_price().unwrap());
        }
        assert_eq!(closes, vec![5000.0, 5001.0]);
        assert_eq!(
            service.tick_file_sources(),
            vec![SubscriptionKey::new("ESZ25", "CME")]
        );
        assert_eq!(service.gateway_status().tailers, 1);

        let _server = script.await.unwrap();
        service.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_symbol_reject_reaches_the_caller() {
        let dir = tick_dir("XYZ", &[1.0]);
        let (connector, script) = rejecting_server("Symbol not found");
        let service =
            MarketDataService::start(service_config(&dir, false), supervisor(connector).spawn([]), None);

        let mut rx = service.subscribe("XYZ", "");
        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match update.kind {
            PriceUpdateKind::Rejected(rejection) => {
                assert_eq!(rejection.category, RejectCategory::UnknownSymbol);
                assert_eq!(rejection.text, "Symbol not found");
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(service.tick_file_sources().is_empty());

        let _server = script.await.unwrap();
        service.shutdown().await;
    }

    #[tokio::test]
    async fn entitlement_reject_without_data_dir_reaches_the_caller() {
        let (connector, script) = rejecting_server("");
        let service =
            MarketDataService::start(ServiceConfig::default(), supervisor(connector).spawn([]), None);

        let mut rx = service.subscribe("ESZ25", "CME");
        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            update.kind,
            PriceUpdateKind::Rejected(ref r) if r.category == RejectCategory::Entitlement
        ));

        let _server = script.await.unwrap();
        service.shutdown().await;
    }

    #[tokio::test]
    async fn supervisor_stop_skips_declined_keys() {
        let dir = tick_dir("ESZ25", &[6000.0]);
        std::fs::copy(
            tick_file_path(dir.path(), "ESZ25"),
            tick_file_path(dir.path(), "XYZ"),
        )
        .unwrap();

        let connector = Arc::new(QueuedConnector::new());
        let (client, mut server) = pair();
        connector.push_stream(client);
        let (logoff_tx, logoff_rx) = tokio::sync::oneshot::channel::<()>();
        let script = tokio::spawn(async move {
            server.handshake().await;
            for _ in 0..2 {
                let request = server.expect_subscribe().await;
                if request.symbol == "XYZ" {
                    server
                        .send(Message::MarketDataReject(MarketDataReject {
                            symbol_id: request.symbol_id,
                            reject_text: "Symbol not found".to_string(),
                        }))
                        .await;
                } else {
                    server.send(snapshot(request.symbol_id, 6000.0)).await;
                }
            }
            logoff_rx.await.unwrap();
            server
                .send(Message::Logoff(Logoff {
                    reason: "maintenance".to_string(),
                    do_not_reconnect: true,
                }))
                .await;
            server
        });

        let service =
            MarketDataService::start(service_config(&dir, false), supervisor(connector).spawn([]), None);
        let mut rejected = service.subscribe("XYZ", "");
        let mut live = service.subscribe("ESZ25", "CME");

        let first = tokio::time::timeout(Duration::from_secs(5), rejected.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first.kind, PriceUpdateKind::Rejected(_)));
        let first = tokio::time::timeout(Duration::from_secs(5), live.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.source, PriceSource::Protocol);
        logoff_tx.send(()).unwrap();

        let fallback = tokio::time::timeout(Duration::from_secs(5), live.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fallback.source, PriceSource::TickFile);
        assert_eq!(
            service.tick_file_sources(),
            vec![SubscriptionKey::new("ESZ25", "CME")]
        );

        let _server = script.await.unwrap();
        service.shutdown().await;
    }

    #[tokio::test]
    async fn any_reject_falls_back_when_configured() {
        let dir = tick_dir("XYZ", &[42.0]);
        let (connector, script) = rejecting_server("Symbol not found");
        let service =
            MarketDataService::start(service_config(&dir, true), supervisor(connector).spawn([]), None);

        let mut rx = service.subscribe("XYZ", "");
        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(update.kind, PriceUpdateKind::Bar(ref r) if (r.close - 42.0).abs() < 1e-9));

        let _server = script.await.unwrap();
        service.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_supervisor_falls_back_for_wanted_keys() {
        let dir = tick_dir("NQZ25", &[21_000.0]);
        let connector = Arc::new(QueuedConnector::new());
        let supervisor = ReconnectSupervisor::new(
            connector,
            SessionConfig::default(),
            ReconnectConfig {
                max_attempts: 1,
                ..fast()
            },
            Arc::new(PriceHub::default()),
        );
        let service =
            MarketDataService::start(service_config(&dir, false), supervisor.spawn([]), None);

        let mut rx = service.subscribe("NQZ25", "CME");
        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.source, PriceSource::TickFile);
        assert!(service.gateway_status().supervisor_stopped);

        let key = SubscriptionKey::new("NQZ25", "CME");
        assert!(service.last_tick(&key).is_some());
        service.unsubscribe(&key);
        assert!(service.tick_file_sources().is_empty());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn reads_local_tick_files_directly() {
        let dir = tick_dir("ESZ25", &[5000.0, 5001.0, 5002.0]);
        let connector = Arc::new(QueuedConnector::new());
        connector.push_error(ConnectionError::Closed);
        let service =
            MarketDataService::start(service_config(&dir, false), supervisor(connector).spawn([]), None);

        let inventory = service.tick_file_inventory().await.unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].symbol, "ESZ25");
        assert_eq!(inventory[0].records, 3);
        assert_eq!(inventory[0].last_price(), Some(5002.0));

        let key = SubscriptionKey::new("ESZ25", "CME");
        let recent = service.recent_ticks(&key, 2).await.unwrap();
        let closes: Vec<f64> = recent.iter().map(|r| r.close).collect();
        assert_eq!(closes, vec![5001.0, 5002.0]);

        assert!(matches!(
            service.recent_ticks(&SubscriptionKey::new("GCZ25", "COMEX"), 1).await,
            Err(ServiceError::TickFile(TickFileError::NotFound { .. }))
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn tick_file_reads_need_a_data_dir() {
        let connector = Arc::new(QueuedConnector::new());
        connector.push_error(ConnectionError::Closed);
        let service =
            MarketDataService::start(ServiceConfig::default(), supervisor(connector).spawn([]), None);

        assert!(matches!(
            service.tick_file_inventory().await,
            Err(ServiceError::NoDataDir)
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn historical_fetch_requires_a_session() {
        let connector = Arc::new(QueuedConnector::new());
        connector.push_error(ConnectionError::Closed);
        let service =
            MarketDataService::start(ServiceConfig::default(), supervisor(connector).spawn([]), None);

        let query = HistoricalQuery::new(
            SubscriptionKey::new("ESZ25", "CME"),
            60,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap(),
            None,
        );
        assert!(matches!(
            service.fetch_historical(query, None).await,
            Err(ServiceError::NotConnected)
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn historical_fetch_streams_records() {
        let connector = Arc::new(QueuedConnector::new());
        let (client, mut server) = pair();
        connector.push_stream(client);
        let script = tokio::spawn(async move {
            server.handshake().await;
            let request = server.expect_historical().await;
            assert_eq!(request.record_interval, 60);
            server
                .send(Message::HistoricalPriceDataResponseHeader(
                    HistoricalPriceDataResponseHeader {
                        request_id: request.request_id,
                        record_interval: 60,
                        ..HistoricalPriceDataResponseHeader::default()
                    },
                ))
                .await;
            server
                .send(Message::HistoricalPriceDataRecordResponse(
                    HistoricalPriceDataRecordResponse {
                        request_id: request.request_id,
                        start_date_time: 45_658.5,
                        open_price: 100.0,
                        high_price: 105.0,
                        low_price: 95.0,
                        last_price: 102.0,
                        is_final_record: true,
                        ..HistoricalPriceDataRecordResponse::default()
                    },
                ))
                .await;
            server
        });

        let handle = supervisor(connector).spawn([]);
        let mut status = handle.watch_status();
        let service = MarketDataService::start(ServiceConfig::default(), handle, None);
        status
            .wait_for(|s| s.state == SessionState::Active)
            .await
            .unwrap();

        let query = HistoricalQuery::new(
            SubscriptionKey::new("ESZ25", "CME"),
            60,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap(),
            None,
        );
        let records = service
            .fetch_historical(query, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .collect_records()
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].timestamp,
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().unwrap()
        );
        assert!((records[0].close - 102.0).abs() < f64::EPSILON);

        let _server = script.await.unwrap();
        service.shutdown().await;
    }
}
