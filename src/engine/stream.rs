//! Live event subscriptions against the engine's SSE endpoints.
//!
//! Each channel (status, stats, logs) is an independent subscription with its
//! own connection phase and latest view. Reconnection and backoff belong to
//! the SSE transport; a channel only mirrors whether it is currently connected
//! and what the newest payload was. Views are published through `watch`
//! channels so any number of readers (including the UI thread) always see the
//! latest value.

use crate::model::{EngineStatus, EngineStats, LogEntry};
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LOG_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// What a channel's transport delivered, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// HTTP stream opened; the engine's own `connected` handshake is still pending.
    Open,
    Message { event: String, data: String },
    TransportError(String),
    /// The transport gave up and will not reconnect.
    Ended,
}

/// Describes one logical channel: where it lives and how its payload folds into the view.
pub trait Feed: Send + Sync + 'static {
    type Payload: DeserializeOwned;
    type View: Clone + Send + Sync + std::fmt::Debug + 'static;

    const PATH: &'static str;
    const EVENT: &'static str;

    fn absorb(view: &mut Self::View, payload: Self::Payload);
}

#[derive(Debug)]
pub struct StatusFeed;

impl Feed for StatusFeed {
    type Payload = EngineStatus;
    type View = Option<EngineStatus>;

    const PATH: &'static str = "/status";
    const EVENT: &'static str = "status-update";

    fn absorb(view: &mut Self::View, payload: Self::Payload) {
        *view = Some(payload);
    }
}

#[derive(Debug)]
pub struct StatsFeed;

impl Feed for StatsFeed {
    type Payload = EngineStats;
    type View = Option<EngineStats>;

    const PATH: &'static str = "/stats";
    const EVENT: &'static str = "stats-update";

    fn absorb(view: &mut Self::View, payload: Self::Payload) {
        *view = Some(payload);
    }
}

#[derive(Debug)]
pub struct LogFeed;

impl Feed for LogFeed {
    type Payload = LogEntry;
    type View = LogTail;

    const PATH: &'static str = "/logs";
    const EVENT: &'static str = "log-entry";

    fn absorb(view: &mut Self::View, payload: Self::Payload) {
        view.push(payload);
    }
}

/// Bounded, most-recent-first list of log entries.
#[derive(Debug, Clone)]
pub struct LogTail {
    cap: usize,
    entries: VecDeque<LogEntry>,
}

impl LogTail {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            entries: VecDeque::with_capacity(cap),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(self.cap);
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LogTail {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAP)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelState<V> {
    pub phase: ConnectionPhase,
    pub view: V,
    pub last_error: Option<String>,
}

impl<V> ChannelState<V> {
    fn new(view: V) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            view,
            last_error: None,
        }
    }

    pub fn connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    /// Fold one transport event into the state. Returns whether anything changed.
    pub fn apply<F: Feed<View = V>>(&mut self, ev: FeedEvent) -> bool {
        match ev {
            FeedEvent::Open => {
                if self.phase == ConnectionPhase::Disconnected {
                    self.phase = ConnectionPhase::Connecting;
                    return true;
                }
                false
            }
            FeedEvent::Message { event, data } => match event.as_str() {
                "connected" => {
                    self.mark_connected();
                    true
                }
                "heartbeat" => false,
                name if name == F::EVENT => match serde_json::from_str::<F::Payload>(&data) {
                    Ok(payload) => {
                        F::absorb(&mut self.view, payload);
                        self.mark_connected();
                        true
                    }
                    Err(e) => {
                        tracing::warn!(
                            channel = F::PATH,
                            error = %e,
                            "undecodable payload ignored"
                        );
                        false
                    }
                },
                other => {
                    tracing::debug!(channel = F::PATH, event = other, "unknown event ignored");
                    false
                }
            },
            FeedEvent::TransportError(msg) => {
                self.phase = ConnectionPhase::Disconnected;
                self.last_error = Some(msg);
                true
            }
            FeedEvent::Ended => {
                let changed = self.phase != ConnectionPhase::Disconnected;
                self.phase = ConnectionPhase::Disconnected;
                changed
            }
        }
    }

    fn mark_connected(&mut self) {
        self.phase = ConnectionPhase::Connected;
        self.last_error = None;
    }
}

/// One closeable subscription. Closing is synchronous and idempotent.
pub struct Subscription<F: Feed> {
    state: Arc<watch::Sender<ChannelState<F::View>>>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl<F: Feed> Subscription<F> {
    /// A subscription with no transport attached; events arrive through [`Subscription::deliver`].
    pub fn detached(view: F::View) -> Self {
        let (tx, _rx) = watch::channel(ChannelState::new(view));
        Self {
            state: Arc::new(tx),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Open the channel at `base_url` + the feed's path. Must be called inside a Tokio runtime.
    pub fn open(base_url: &str, view: F::View) -> Self {
        let mut sub = Self::detached(view);
        let url = format!("{}{}", base_url.trim_end_matches('/'), F::PATH);
        sub.state.send_modify(|s| s.phase = ConnectionPhase::Connecting);
        let state = sub.state.clone();
        let cancel = sub.cancel.clone();
        sub.task = Some(tokio::spawn(pump::<F>(url, state, cancel)));
        sub
    }

    pub fn deliver(&self, ev: FeedEvent) {
        deliver::<F>(&self.state, &self.cancel, ev);
    }

    pub fn watch(&self) -> watch::Receiver<ChannelState<F::View>> {
        self.state.subscribe()
    }

    pub fn current(&self) -> ChannelState<F::View> {
        self.state.borrow().clone()
    }

    pub fn connected(&self) -> bool {
        self.state.borrow().connected()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close(&mut self) {
        // Cancel first: a delivery that loses the race sees the token and drops its event.
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state.send_if_modified(|s| {
            let changed = s.phase != ConnectionPhase::Disconnected;
            s.phase = ConnectionPhase::Disconnected;
            changed
        });
    }
}

impl<F: Feed> Drop for Subscription<F> {
    fn drop(&mut self) {
        self.close();
    }
}

fn deliver<F: Feed>(
    state: &watch::Sender<ChannelState<F::View>>,
    cancel: &CancellationToken,
    ev: FeedEvent,
) {
    state.send_if_modified(|s| {
        if cancel.is_cancelled() {
            return false;
        }
        s.apply::<F>(ev)
    });
}

async fn pump<F: Feed>(
    url: String,
    state: Arc<watch::Sender<ChannelState<F::View>>>,
    cancel: CancellationToken,
) {
    tracing::info!(%url, "opening engine subscription");
    let mut source = EventSource::get(&url);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.next() => next,
        };
        let ev = match next {
            Some(Ok(Event::Open)) => FeedEvent::Open,
            Some(Ok(Event::Message(msg))) => FeedEvent::Message {
                event: msg.event,
                data: msg.data,
            },
            Some(Err(e)) => {
                tracing::warn!(%url, error = %e, "engine subscription error");
                FeedEvent::TransportError(e.to_string())
            }
            None => {
                deliver::<F>(&state, &cancel, FeedEvent::Ended);
                break;
            }
        };
        deliver::<F>(&state, &cancel, ev);
    }
    source.close();
    tracing::debug!(%url, "engine subscription closed");
}

/// Read-only handles onto the three channels; cheap to clone and `Send`.
#[derive(Debug, Clone)]
pub struct StreamViews {
    pub status: watch::Receiver<ChannelState<Option<EngineStatus>>>,
    pub stats: watch::Receiver<ChannelState<Option<EngineStats>>>,
    pub logs: watch::Receiver<ChannelState<LogTail>>,
}

/// The three engine subscriptions as one unit.
pub struct StreamClient {
    pub status: Subscription<StatusFeed>,
    pub stats: Subscription<StatsFeed>,
    pub logs: Subscription<LogFeed>,
}

impl StreamClient {
    pub fn connect(base_url: &str, log_cap: usize) -> Self {
        Self {
            status: Subscription::open(base_url, None),
            stats: Subscription::open(base_url, None),
            logs: Subscription::open(base_url, LogTail::with_capacity(log_cap)),
        }
    }

    pub fn detached(log_cap: usize) -> Self {
        Self {
            status: Subscription::detached(None),
            stats: Subscription::detached(None),
            logs: Subscription::detached(LogTail::with_capacity(log_cap)),
        }
    }

    pub fn views(&self) -> StreamViews {
        StreamViews {
            status: self.status.watch(),
            stats: self.stats.watch(),
            logs: self.logs.watch(),
        }
    }

    pub fn close(&mut self) {
        self.status.close();
        self.stats.close();
        self.logs.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(event: &str, data: &str) -> FeedEvent {
        FeedEvent::Message {
            event: event.into(),
            data: data.into(),
        }
    }

    const STATUS: &str = concat!(
        r#"{"state":"running","progress":10,"elapsed":"00:01","estimated":"00:09","#,
        r#""nextTask":"batch 2","latestStatus":"ok"}"#
    );
    const STATS: &str =
        r#"{"totalRecords":100,"processedRecords":10,"successCount":9,"errorCount":1}"#;

    #[test]
    fn status_updates_replace_the_whole_snapshot() {
        let mut st = ChannelState::<Option<EngineStatus>>::new(None);
        assert!(st.apply::<StatusFeed>(msg("status-update", STATUS)));
        assert_eq!(st.view.as_ref().unwrap().next_task, "batch 2");
        assert!(st.connected());

        assert!(st.apply::<StatusFeed>(msg("status-update", r#"{"state":"paused"}"#)));
        let v = st.view.as_ref().unwrap();
        assert_eq!(v.state, "paused");
        // Not merged: fields absent from the new payload are reset.
        assert_eq!(v.next_task, "");
    }

    #[test]
    fn heartbeat_and_garbage_leave_snapshot_alone() {
        let mut st = ChannelState::<Option<EngineStats>>::new(None);
        st.apply::<StatsFeed>(msg("stats-update", STATS));
        let before = st.view;
        assert!(!st.apply::<StatsFeed>(msg("heartbeat", "")));
        assert!(!st.apply::<StatsFeed>(msg("stats-update", "{not json")));
        assert!(!st.apply::<StatsFeed>(msg("status-update", STATUS)));
        assert_eq!(st.view, before);
    }

    #[test]
    fn transport_error_disconnects_but_keeps_last_view() {
        let mut st = ChannelState::<Option<EngineStats>>::new(None);
        st.apply::<StatsFeed>(FeedEvent::Open);
        assert_eq!(st.phase, ConnectionPhase::Connecting);
        st.apply::<StatsFeed>(msg("connected", "{}"));
        st.apply::<StatsFeed>(msg("stats-update", STATS));
        st.apply::<StatsFeed>(FeedEvent::TransportError("reset".into()));
        assert_eq!(st.phase, ConnectionPhase::Disconnected);
        assert_eq!(st.last_error.as_deref(), Some("reset"));
        assert_eq!(st.view.unwrap().total_records, 100);
    }

    #[test]
    fn log_tail_is_capped_and_most_recent_first() {
        let mut st = ChannelState::new(LogTail::with_capacity(3));
        for i in 0..5 {
            st.apply::<LogFeed>(msg("log-entry", &format!(r#"{{"message":"line {i}"}}"#)));
        }
        let lines: Vec<String> = st.view.iter().map(LogEntry::to_line).collect();
        assert_eq!(lines, vec!["line 4", "line 3", "line 2"]);
    }

    #[test]
    fn live_connected_needs_status_and_stats() {
        let client = StreamClient::detached(10);
        let views = client.views();
        let live = |v: &StreamViews| {
            crate::engine::LiveSnapshot::from_views(v, false).live_connected
        };
        assert!(!live(&views));

        client.status.deliver(msg("connected", ""));
        assert!(!live(&views));
        // A data event counts as a connection signal too.
        client.stats.deliver(msg("stats-update", STATS));
        assert!(live(&views));

        // Logs connectivity is irrelevant.
        client.logs.deliver(FeedEvent::TransportError("down".into()));
        assert!(live(&views));

        client.stats.deliver(FeedEvent::TransportError("down".into()));
        assert!(!live(&views));
    }

    #[test]
    fn close_is_idempotent_and_stops_deliveries() {
        let mut sub = Subscription::<StatusFeed>::detached(None);
        sub.deliver(msg("connected", ""));
        assert!(sub.connected());
        sub.close();
        sub.close();
        assert!(sub.is_closed());
        assert!(!sub.connected());
        sub.deliver(msg("status-update", STATUS));
        assert!(sub.current().view.is_none());
    }

    #[tokio::test]
    async fn closing_an_open_subscription_before_it_connects() {
        // Nothing listens on port 9; the transport keeps retrying until closed.
        let mut client = StreamClient::connect("http://127.0.0.1:9", 5);
        assert_eq!(client.status.current().phase, ConnectionPhase::Connecting);
        client.close();
        client.close();
        assert_eq!(client.status.current().phase, ConnectionPhase::Disconnected);
        assert!(!client.stats.connected());
    }

    #[tokio::test]
    async fn mirrors_an_sse_feed() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = format!(
            "event: connected\ndata: {{}}\n\n\
             event: heartbeat\ndata: \n\n\
             event: status-update\ndata: {STATUS}\n\n"
        );
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let mut sub = Subscription::<StatusFeed>::open(&server.uri(), None);
        let mut rx = sub.watch();
        let seen = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Some(status) = rx.borrow_and_update().view.clone() {
                    return status;
                }
                if rx.changed().await.is_err() {
                    panic!("channel dropped");
                }
            }
        })
        .await
        .expect("status snapshot within timeout");
        assert_eq!(seen.state, "running");
        assert_eq!(seen.latest_status, "ok");
        sub.close();
    }
}
