use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use winecord::{
    build_key, Attributes, BucketId, Client, Completion, ConnId, Empty, HttpRequest, HttpResponse,
    Method, RestConfig, RestError, RouteArg, Transport, TransportError, UserData, Waker,
};

/// Outcome for the n-th transfer; `None` leaves it hanging.
type Responder =
    Box<dyn FnMut(usize, &HttpRequest) -> Option<Result<HttpResponse, TransportError>> + Send>;

#[derive(Debug, Clone)]
struct Sent {
    url: String,
    authorization: Option<String>,
    reason: Option<String>,
    at: Instant,
}

type SentLog = Arc<Mutex<Vec<Sent>>>;

struct MockTransport {
    responder: Responder,
    log: SentLog,
    completed: Vec<Completion>,
    waker: Option<Waker>,
}

impl Transport for MockTransport {
    fn bind(&mut self, waker: Waker) {
        self.waker = Some(waker);
    }

    fn start(&mut self, conn: ConnId, request: HttpRequest) {
        let n = {
            let mut log = self.log.lock();
            log.push(Sent {
                url: request.url.clone(),
                authorization: request.headers.get("authorization").map(str::to_string),
                reason: request.headers.get("x-audit-log-reason").map(str::to_string),
                at: Instant::now(),
            });
            log.len() - 1
        };
        if let Some(result) = (self.responder)(n, &request) {
            self.completed.push(Completion { conn, result });
            if let Some(waker) = &self.waker {
                waker.wake();
            }
        }
    }

    fn cancel(&mut self, conn: ConnId) {
        self.completed.retain(|completion| completion.conn != conn);
    }

    fn drain_completed(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completed)
    }
}

fn client_with<F>(config: RestConfig, responder: F) -> (Client, SentLog)
where
    F: FnMut(usize, &HttpRequest) -> Option<Result<HttpResponse, TransportError>> + Send + 'static,
{
    let log: SentLog = Arc::new(Mutex::new(Vec::new()));
    let transport = MockTransport {
        responder: Box::new(responder),
        log: Arc::clone(&log),
        completed: Vec::new(),
        waker: None,
    };
    let client = Client::with_transport(config.with_max_poll_wait_ms(20), transport).unwrap();
    (client, log)
}

/// Runs the main loop until `done` holds, for at most 5 seconds.
fn pump_until(client: &Client, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        client.run_once();
    }
}

fn no_content() -> Option<Result<HttpResponse, TransportError>> {
    Some(Ok(HttpResponse::new(204)))
}

#[test]
fn test_fifo_within_bucket() {
    let (client, log) = client_with(RestConfig::webhook(), |_, _| {
        Some(Ok(HttpResponse::new(204)
            .with_header("x-ratelimit-bucket", "msgs")
            .with_header("x-ratelimit-limit", "5")
            .with_header("x-ratelimit-remaining", "4")
            .with_header("x-ratelimit-reset-after", "1")))
    });

    let order = Arc::new(Mutex::new(Vec::new()));
    for message in [10u64, 11, 12] {
        let order = Arc::clone(&order);
        client
            .request(
                Attributes::<Empty>::new().done(move |_, _| order.lock().push(message)),
                None,
                Method::Delete,
                "/channels/%u/messages/%u",
                &[RouteArg::Id(1), RouteArg::Id(message)],
            )
            .unwrap();
    }

    pump_until(&client, || order.lock().len() == 3);
    assert_eq!(*order.lock(), vec![10, 11, 12]);

    let urls: Vec<String> = log.lock().iter().map(|sent| sent.url.clone()).collect();
    assert!(urls[0].ends_with("/channels/1/messages/10"));
    assert!(urls[1].ends_with("/channels/1/messages/11"));
    assert!(urls[2].ends_with("/channels/1/messages/12"));

    let buckets = client.buckets();
    let msgs = buckets.iter().find(|b| b.hash == "msgs").unwrap();
    assert_eq!(msgs.limit, 5);
    assert_eq!(msgs.remaining, 4);
    assert_eq!(client.metrics().known_buckets, 1);
}

#[test]
fn test_route_without_bucket_goes_to_miss() {
    let (client, _log) = client_with(RestConfig::webhook(), |n, _| {
        let remaining = if n == 0 { "7" } else { "3" };
        Some(Ok(HttpResponse::new(200)
            .with_header("x-ratelimit-remaining", remaining)
            .with_body("[]")))
    });

    let get = |client: &Client| {
        client.request_sync(
            Attributes::<Vec<serde_json::Value>>::new(),
            None,
            Method::Get,
            "/channels/%u/messages",
            &[RouteArg::Id(123)],
        )
    };

    assert_eq!(get(&client).unwrap(), Vec::<serde_json::Value>::new());
    let miss = client.buckets().into_iter().find(|b| b.id == BucketId::Miss).unwrap();
    assert_eq!(miss.remaining, 7);

    // matched straight to miss this time
    get(&client).unwrap();
    let miss = client.buckets().into_iter().find(|b| b.id == BucketId::Miss).unwrap();
    assert_eq!(miss.remaining, 3);
    assert_eq!(client.metrics().known_buckets, 0);
}

#[test]
fn test_deletes_share_route_key_and_bucket() {
    let a = build_key(Method::Delete, "/channels/%u/messages/%u", &[RouteArg::Id(123), RouteArg::Id(111)]);
    let b = build_key(Method::Delete, "/channels/%u/messages/%u", &[RouteArg::Id(123), RouteArg::Id(222)]);
    assert_eq!(a, b);

    let (client, log) = client_with(RestConfig::webhook(), |_, _| {
        Some(Ok(HttpResponse::new(204)
            .with_header("x-ratelimit-bucket", "del")
            .with_header("x-ratelimit-remaining", "10")))
    });

    for message in [111u64, 222] {
        client
            .request_sync(
                Attributes::<Empty>::new(),
                None,
                Method::Delete,
                "/channels/%u/messages/%u",
                &[RouteArg::Id(123), RouteArg::Id(message)],
            )
            .unwrap();
    }

    assert_eq!(log.lock().len(), 2);
    let bounded: Vec<_> = client
        .buckets()
        .into_iter()
        .filter(|b| matches!(b.id, BucketId::Bounded(_)))
        .collect();
    assert_eq!(bounded.len(), 1);
    assert_eq!(bounded[0].hash, "del");
}

#[test]
fn test_global_ratelimit_delays_retry() {
    let (client, log) = client_with(RestConfig::webhook(), |n, _| {
        if n == 0 {
            Some(Ok(HttpResponse::new(429)
                .with_body(r#"{"global":true,"message":"You are being rate limited.","retry_after":0.2}"#)))
        } else {
            no_content()
        }
    });

    client
        .request_sync(Attributes::<Empty>::new(), None, Method::Post, "/channels/%u/typing", &[RouteArg::Id(5)])
        .unwrap();

    let log = log.lock();
    assert_eq!(log.len(), 2);
    assert!(log[1].at.duration_since(log[0].at) >= Duration::from_millis(180));

    let metrics = client.metrics();
    assert_eq!(metrics.ratelimited, 1);
    assert_eq!(metrics.global_ratelimits, 1);
    assert_eq!(metrics.retried, 1);
    assert_eq!(metrics.succeeded, 1);
}

#[test]
fn test_global_cooldown_holds_other_buckets() {
    let mut global_sent = 0;
    let (client, log) = client_with(RestConfig::webhook(), move |_, request| {
        if request.url.contains("/channels/2/") {
            // bucket b: exhausted, but its own window resets after 10 ms
            return Some(Ok(HttpResponse::new(204)
                .with_header("x-ratelimit-bucket", "b")
                .with_header("x-ratelimit-remaining", "0")
                .with_header("x-ratelimit-reset-after", "0.01")));
        }
        global_sent += 1;
        if global_sent == 1 {
            Some(Ok(HttpResponse::new(429).with_body(r#"{"global":true,"retry_after":0.3}"#)))
        } else {
            no_content()
        }
    });

    let delete_in = |channel: u64| {
        client.request(
            Attributes::<Empty>::new(),
            None,
            Method::Delete,
            "/channels/%u/messages/%u",
            &[RouteArg::Id(channel), RouteArg::Id(1)],
        )
    };

    client
        .request_sync(
            Attributes::<Empty>::new(),
            None,
            Method::Delete,
            "/channels/%u/messages/%u",
            &[RouteArg::Id(2), RouteArg::Id(1)],
        )
        .unwrap();

    delete_in(1).unwrap();
    pump_until(&client, || log.lock().len() == 2);
    let global_hit = log.lock()[1].at;

    delete_in(2).unwrap();
    pump_until(&client, || client.metrics().succeeded == 3);

    let log = log.lock();
    let second_b = log
        .iter()
        .skip(2)
        .find(|sent| sent.url.contains("/channels/2/"))
        .unwrap();
    assert!(second_b.at.duration_since(global_hit) >= Duration::from_millis(250));
}

#[test]
fn test_retry_bound() {
    let (client, log) = client_with(RestConfig::webhook().with_retry_limit(3), |_, _| {
        Some(Ok(HttpResponse::new(503)))
    });

    let result = client.request_sync(Attributes::<Empty>::new(), None, Method::Get, "/gateway", &[]);
    assert_eq!(result, Err(RestError::Server { status: 503 }));
    assert_eq!(log.lock().len(), 4);

    let metrics = client.metrics();
    assert_eq!(metrics.retried, 3);
    assert_eq!(metrics.failed, 1);
}

#[test]
fn test_terminal_error_reaches_fail_callback() {
    let (client, log) = client_with(RestConfig::webhook(), |_, _| {
        Some(Ok(HttpResponse::new(404).with_body(r#"{"message":"Unknown Channel","code":10003}"#)))
    });

    let failure = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&failure);
    client
        .request(
            Attributes::<Empty>::new()
                .done(|_, _| panic!("404 must not succeed"))
                .fail(move |resp| *slot.lock() = resp.error.clone()),
            None,
            Method::Get,
            "/channels/%u",
            &[RouteArg::Id(9)],
        )
        .unwrap();

    pump_until(&client, || failure.lock().is_some());
    match failure.lock().take() {
        Some(RestError::Http { status, body }) => {
            assert_eq!(status, 404);
            assert!(body.contains("Unknown Channel"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    // not retried
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn test_authorization_and_reason_headers() {
    let (bot, bot_log) = client_with(RestConfig::bot("secret"), |_, _| no_content());
    bot.request_sync(
        Attributes::<Empty>::new().reason("spring cleaning"),
        None,
        Method::Delete,
        "/channels/%u",
        &[RouteArg::Id(1)],
    )
    .unwrap();
    {
        let log = bot_log.lock();
        assert_eq!(log[0].authorization.as_deref(), Some("Bot secret"));
        assert_eq!(log[0].reason.as_deref(), Some("spring cleaning"));
    }

    let (webhook, webhook_log) = client_with(RestConfig::webhook(), |_, _| no_content());
    webhook
        .request_sync(
            Attributes::<Empty>::new(),
            Some(br#"{"content":"hi"}"#),
            Method::Post,
            "/webhooks/%u/%s",
            &[RouteArg::Id(42), RouteArg::Str("token")],
        )
        .unwrap();
    let log = webhook_log.lock();
    assert!(log[0].authorization.is_none());
    assert!(log[0].reason.is_none());
    assert!(log[0].url.ends_with("/webhooks/42/token"));
}

#[test]
fn test_empty_body_fails_without_network() {
    let (client, log) = client_with(RestConfig::webhook(), |_, _| no_content());
    let result = client.request(Attributes::<Empty>::new(), Some(b""), Method::Post, "/channels/%u/messages", &[RouteArg::Id(1)]);
    assert_eq!(result, Err(RestError::MalformedPayload));

    thread::sleep(Duration::from_millis(30));
    assert!(log.lock().is_empty());
    assert_eq!(client.metrics().submitted, 0);
}

#[test]
fn test_request_data_lifecycle() {
    let (client, _log) = client_with(RestConfig::webhook(), |_, _| no_content());
    let cleaned = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));

    let data: UserData = Arc::new(String::from("audit"));
    let counter = Arc::clone(&cleaned);
    client.register_data(&data, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let slot = Arc::clone(&seen);
    client
        .request(
            Attributes::<Empty>::new()
                .data(Arc::clone(&data))
                .done(move |resp, _| *slot.lock() = resp.data_as::<String>().cloned()),
            None,
            Method::Delete,
            "/channels/%u",
            &[RouteArg::Id(3)],
        )
        .unwrap();

    pump_until(&client, || seen.lock().is_some());
    assert_eq!(seen.lock().as_deref(), Some("audit"));
    // the registration still holds a visit
    assert_eq!(cleaned.load(Ordering::SeqCst), 0);

    client.release_data(&data).unwrap();
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    assert!(!client.is_registered(&data));
}

#[test]
fn test_cancel_queued_request() {
    // first transfer hangs, keeping the second queued behind it
    let (client, log) = client_with(RestConfig::webhook(), |n, _| if n == 0 { None } else { no_content() });

    let fired = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for message in [1u64, 2] {
        let fired = Arc::clone(&fired);
        handles.push(
            client
                .request(
                    Attributes::<Empty>::new()
                        .done({
                            let fired = Arc::clone(&fired);
                            move |_, _| {
                                fired.fetch_add(1, Ordering::SeqCst);
                            }
                        })
                        .fail(move |_| {
                            fired.fetch_add(1, Ordering::SeqCst);
                        }),
                    None,
                    Method::Delete,
                    "/channels/%u/messages/%u",
                    &[RouteArg::Id(1), RouteArg::Id(message)],
                )
                .unwrap(),
        );
    }

    pump_until(&client, || log.lock().len() == 1);
    client.cancel(handles[1]);
    pump_until(&client, || client.metrics().canceled == 1);

    client.shutdown();
    client.dispatch_responses();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(log.lock().len(), 1);
    assert_eq!(client.metrics().canceled, 2);
}

#[test]
fn test_shutdown_cancels_outstanding_requests() {
    let (client, _log) = client_with(RestConfig::webhook(), |_, _| None);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    client
        .request(
            Attributes::<Empty>::new().done(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
            Method::Get,
            "/channels/%u/messages",
            &[RouteArg::Id(1)],
        )
        .unwrap();

    let sync_client = client.clone();
    let waiter = thread::spawn(move || {
        sync_client.request_sync(Attributes::<Empty>::new(), None, Method::Get, "/channels/%u/messages", &[RouteArg::Id(2)])
    });

    pump_until(&client, || client.metrics().submitted == 2);
    client.shutdown();

    assert_eq!(waiter.join().unwrap(), Err(RestError::Canceled));
    client.dispatch_responses();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(client.metrics().canceled, 2);
    assert!(!client.is_running());
}

#[test]
fn test_main_loop_runs_timers_and_hooks() {
    let (client, _log) = client_with(RestConfig::webhook(), |_, _| no_content());

    let cycles = Arc::new(AtomicUsize::new(0));
    let cycle_counter = Arc::clone(&cycles);
    client.set_on_cycle(move |_| {
        cycle_counter.fetch_add(1, Ordering::SeqCst);
    });

    let ticks = Arc::new(AtomicUsize::new(0));
    let tick_counter = Arc::clone(&ticks);
    let id = client.timer_interval(
        move |client: &mut Client, _| {
            if tick_counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                client.stop();
            }
        },
        0,
        5,
        3,
    );

    client.run();
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
    assert!(cycles.load(Ordering::SeqCst) >= 3);
    assert!(client.timer_get(id).is_none());
}

#[test]
fn test_requests_from_many_threads() {
    let (client, log) = client_with(RestConfig::webhook(), |_, _| {
        Some(Ok(HttpResponse::new(200)
            .with_header("x-ratelimit-bucket", "shared")
            .with_header("x-ratelimit-remaining", "50")
            .with_body(r#"{"ok":true}"#)))
    });

    let handles: Vec<_> = (0..8u64)
        .map(|channel| {
            let client = client.clone();
            thread::spawn(move || {
                client
                    .request_sync(
                        Attributes::<serde_json::Value>::new(),
                        None,
                        Method::Get,
                        "/channels/%u",
                        &[RouteArg::Id(channel)],
                    )
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap()["ok"], true);
    }
    assert_eq!(log.lock().len(), 8);
    assert_eq!(client.metrics().succeeded, 8);
}
