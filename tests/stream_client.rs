use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use ferris_market_feeds::{
    models::{
        Callback, Change, ConnectionState, InfoEvent, InfoHandler, Snapshot, StreamEvent, Update,
    },
    ClientConfig, ExchangeStreamClient, StreamError,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};

const BOOK_CHAN_ID: u64 = 17082;
/// Pushed frame the mock turns into a websocket ping.
const PING_FRAME: &str = "keepalive";

/// Scripted Bitfinex upstream. Books are acknowledged with a two-level
/// snapshot, trades are rejected and a ticker subscribe makes it hang up.
#[derive(Clone)]
struct MockBitfinex {
    received: mpsc::UnboundedSender<Value>,
    pushes: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
}

async fn spawn_server(app: Router) -> (String, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose address");
    let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_receiver.await;
            })
            .await
            .expect("server should run");
    });

    (format!("127.0.0.1:{}", addr.port()), shutdown_sender, task)
}

async fn upstream_ws_handler(socket: WebSocket, state: MockBitfinex) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<AxumWsMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, AxumWsMessage::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let pushes = state
        .pushes
        .lock()
        .expect("push receiver lock should not be poisoned")
        .take();
    let forwarder = pushes.map(|mut pushes| {
        let outbound = outbound.clone();
        tokio::spawn(async move {
            while let Some(frame) = pushes.recv().await {
                let message = if frame == PING_FRAME {
                    AxumWsMessage::Ping(PING_FRAME.as_bytes().to_vec().into())
                } else {
                    text(frame)
                };
                if outbound.send(message).is_err() {
                    break;
                }
            }
        })
    });

    let _ = outbound.send(text(
        json!({"event": "info", "version": 2, "serverId": "mock", "platform": {"status": 1}})
            .to_string(),
    ));

    while let Some(Ok(message)) = receiver.next().await {
        let payload = match message {
            AxumWsMessage::Text(payload) => payload,
            AxumWsMessage::Pong(payload) => {
                let echoed = String::from_utf8_lossy(&payload.to_vec()).into_owned();
                let _ = state.received.send(json!({ "pong": echoed }));
                continue;
            }
            _ => continue,
        };
        let Ok(request) = serde_json::from_str::<Value>(payload.as_str()) else {
            continue;
        };
        let _ = state.received.send(request.clone());

        let sub_id = request.get("subId").cloned().unwrap_or(Value::Null);
        match (
            request.get("event").and_then(Value::as_str),
            request.get("channel").and_then(Value::as_str),
        ) {
            (Some("subscribe"), Some("book")) => {
                let _ = outbound.send(text(
                    json!({
                        "event": "subscribed",
                        "channel": "book",
                        "chanId": BOOK_CHAN_ID,
                        "symbol": request["symbol"],
                        "len": request["len"],
                        "subId": sub_id,
                    })
                    .to_string(),
                ));
                let _ = outbound.send(text(
                    json!([BOOK_CHAN_ID, [[100.0, 1, 2.0], [101.0, 2, -1.5]]]).to_string(),
                ));
            }
            (Some("subscribe"), Some("trades")) => {
                let _ = outbound.send(text(
                    json!({
                        "event": "error",
                        "msg": "symbol: invalid",
                        "code": 10300,
                        "channel": "trades",
                        "subId": sub_id,
                    })
                    .to_string(),
                ));
            }
            (Some("subscribe"), Some("ticker")) => {
                let _ = outbound.send(AxumWsMessage::Close(None));
            }
            (Some("unsubscribe"), _) => {
                let _ = outbound.send(text(
                    json!({"event": "unsubscribed", "status": "OK", "chanId": request["chanId"]})
                        .to_string(),
                ));
            }
            _ => {}
        }
    }

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    let _ = writer.await;
}

fn text(payload: String) -> AxumWsMessage {
    AxumWsMessage::Text(payload.into())
}

async fn upstream_route(
    ws: WebSocketUpgrade,
    State(state): State<MockBitfinex>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| upstream_ws_handler(socket, state))
}

struct Harness {
    client: ExchangeStreamClient,
    received: mpsc::UnboundedReceiver<Value>,
    pushes: mpsc::UnboundedSender<String>,
    infos: Arc<Mutex<Vec<InfoEvent>>>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        let (received_sender, received) = mpsc::unbounded_channel();
        let (pushes, push_receiver) = mpsc::unbounded_channel();
        let state = MockBitfinex {
            received: received_sender,
            pushes: Arc::new(Mutex::new(Some(push_receiver))),
        };
        let app = Router::new()
            .route("/ws/2", get(upstream_route))
            .with_state(state);
        let (addr, shutdown, server) = spawn_server(app).await;

        let config = ClientConfig {
            bitfinex_ws_url: format!("ws://{addr}/ws/2"),
            connect_timeout: Duration::from_secs(3),
            subscribe_timeout: Duration::from_secs(3),
            ..ClientConfig::default()
        };
        let client = ExchangeStreamClient::bitfinex(config);

        let infos = Arc::new(Mutex::new(Vec::new()));
        let sink = infos.clone();
        let info_handler: InfoHandler = Arc::new(move |event: InfoEvent| {
            sink.lock()
                .expect("info lock should not be poisoned")
                .push(event);
        });
        client
            .connect(info_handler)
            .await
            .expect("client should connect to the mock upstream");

        Self {
            client,
            received,
            pushes,
            infos,
            shutdown,
            server,
        }
    }

    async fn next_request(&mut self) -> Value {
        timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("upstream should receive a request in time")
            .expect("request channel should stay open")
    }

    async fn stop(self) {
        self.client.disconnect().await;
        let _ = self.shutdown.send(());
        let _ = timeout(Duration::from_secs(2), self.server).await;
    }
}

type Events = Arc<Mutex<Vec<StreamEvent>>>;

fn recorder() -> (Events, Callback) {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: Callback = Arc::new(move |event: &StreamEvent| {
        sink.lock()
            .expect("event lock should not be poisoned")
            .push(event.clone());
    });
    (events, callback)
}

async fn wait_for_events(events: &Events, count: usize) -> Vec<StreamEvent> {
    timeout(Duration::from_secs(2), async {
        loop {
            {
                let events = events.lock().expect("event lock should not be poisoned");
                if events.len() >= count {
                    return events.clone();
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("callback should fire in time")
}

#[tokio::test]
async fn order_book_stream_is_shared_between_subscribers() {
    let mut harness = Harness::start().await;
    assert_eq!(harness.client.state(), ConnectionState::Connected);

    let (first_events, first_callback) = recorder();
    let (first, snapshot) = harness
        .client
        .subscribe_order_book("BTC/USD", Some(25), first_callback)
        .await
        .expect("book subscribe should succeed");
    let Snapshot::Book(book) = snapshot else {
        panic!("expected a book snapshot, got {snapshot:?}");
    };
    assert_eq!(book.best_bid(), Some((100.0, 2.0)));
    assert_eq!(book.best_ask(), Some((101.0, 1.5)));

    let request = harness.next_request().await;
    assert_eq!(request["event"], "subscribe");
    assert_eq!(request["channel"], "book");
    assert_eq!(request["symbol"], "tBTCUSD");
    assert_eq!(request["len"], "25");

    let (second_events, second_callback) = recorder();
    let (second, shared) = harness
        .client
        .subscribe_order_book("tBTCUSD", Some(25), second_callback)
        .await
        .expect("second book subscribe should reuse the stream");
    assert_eq!(second.key, first.key);
    assert_ne!(second.subscriber, first.subscriber);
    assert_eq!(shared, Snapshot::Book(book));

    harness
        .pushes
        .send(json!([BOOK_CHAN_ID, [99.5, 1, 3.0]]).to_string())
        .expect("push channel should be open");

    for events in [&first_events, &second_events] {
        let events = wait_for_events(events, 1).await;
        let Change::Update(Update::Book(updated)) = &events[0].change else {
            panic!("expected a book update, got {:?}", events[0].change);
        };
        assert_eq!(events[0].sender, "bitfinex");
        assert_eq!(updated.bid(99.5), Some(3.0));
        assert_eq!(updated.best_bid(), Some((100.0, 2.0)));
    }

    harness.client.unsubscribe(&first).await;
    harness.client.unsubscribe(&second).await;

    // The second subscribe never reached the exchange; the next request is
    // the release of the shared stream.
    let request = harness.next_request().await;
    assert_eq!(request["event"], "unsubscribe");
    assert_eq!(request["chanId"], BOOK_CHAN_ID);

    harness.stop().await;
}

#[tokio::test]
async fn upstream_ping_is_answered_with_pong() {
    let mut harness = Harness::start().await;

    harness
        .pushes
        .send(PING_FRAME.to_string())
        .expect("push channel should be open");
    assert_eq!(harness.next_request().await, json!({ "pong": PING_FRAME }));

    // The session keeps serving requests after answering the ping.
    let (_, callback) = recorder();
    harness
        .client
        .subscribe_order_book("BTCUSD", Some(25), callback)
        .await
        .expect("book subscribe should succeed");
    assert_eq!(harness.next_request().await["event"], "subscribe");
    assert_eq!(harness.client.state(), ConnectionState::Connected);

    harness.stop().await;
}

#[tokio::test]
async fn rejected_subscription_surfaces_the_exchange_error() {
    let harness = Harness::start().await;

    let (_, callback) = recorder();
    let err = harness
        .client
        .subscribe_trades("BTCUSD", callback)
        .await
        .expect_err("trades subscribe should be rejected");
    assert_eq!(
        err,
        StreamError::SubscriptionFailure {
            code: 10300,
            message: "symbol: invalid".to_string(),
        }
    );
    assert_eq!(harness.client.state(), ConnectionState::Connected);

    harness.stop().await;
}

#[tokio::test]
async fn upstream_close_fails_pending_work_and_notifies() {
    let harness = Harness::start().await;
    let mut states = harness.client.state_changes();

    let (_, callback) = recorder();
    let err = harness
        .client
        .subscribe_ticker("BTCUSD", callback)
        .await
        .expect_err("pending subscribe should fail when the upstream closes");
    assert!(matches!(err, StreamError::Transport(_)), "unexpected error {err:?}");

    timeout(
        Duration::from_secs(2),
        states.wait_for(|state| *state == ConnectionState::Disconnected),
    )
    .await
    .expect("state should settle in time")
    .expect("state channel should stay open");

    let infos = harness
        .infos
        .lock()
        .expect("info lock should not be poisoned")
        .clone();
    assert!(infos
        .iter()
        .any(|event| matches!(event, InfoEvent::Disconnected { sender: "bitfinex", .. })));

    // Disconnecting after the upstream is gone is a no-op.
    harness.stop().await;
}
