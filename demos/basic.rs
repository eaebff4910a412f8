//! Basic usage example for the winecord crate.
//!
//! ```text
//! WINECORD_TOKEN=... WINECORD_CHANNEL=123 RUST_LOG=winecord=debug cargo run --example basic
//! ```

use serde::Deserialize;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use winecord::{Attributes, ClientBuilder, Method, RouteArg};

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    id: String,
    content: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (Ok(token), Some(channel)) = (
        env::var("WINECORD_TOKEN"),
        env::var("WINECORD_CHANNEL").ok().and_then(|id| id.parse::<u64>().ok()),
    ) else {
        eprintln!("set WINECORD_TOKEN and WINECORD_CHANNEL to run this example");
        return;
    };

    let client = ClientBuilder::new()
        .token(token)
        .retry_limit(3)
        .build()
        .expect("failed to start client");

    println!("=== Blocking request ===\n");
    match client.request_sync(
        Attributes::<Channel>::new(),
        None,
        Method::Get,
        "/channels/%u",
        &[RouteArg::Id(channel)],
    ) {
        Ok(ch) => println!("   Channel {} ({})", ch.id, ch.name.unwrap_or_default()),
        Err(err) => println!("   ⛔ {}", err),
    }

    println!("\n=== Async requests ===\n");
    let finished = Arc::new(AtomicBool::new(false));
    for n in 1..=3 {
        let last = n == 3;
        let done_flag = Arc::clone(&finished);
        let fail_flag = Arc::clone(&finished);
        let body = format!(r#"{{"content":"winecord says hello #{}"}}"#, n);

        client
            .request(
                Attributes::<Message>::new()
                    .done(move |_, msg| {
                        println!("   ✅ Message {}: {}", msg.id, msg.content);
                        if last {
                            done_flag.store(true, Ordering::SeqCst);
                        }
                    })
                    .fail(move |resp| {
                        println!("   ⛔ {:?}", resp.error);
                        if last {
                            fail_flag.store(true, Ordering::SeqCst);
                        }
                    }),
                Some(body.as_bytes()),
                Method::Post,
                "/channels/%u/messages",
                &[RouteArg::Id(channel)],
            )
            .expect("request rejected");
    }

    // messages to one channel share a bucket and go out one by one
    while !finished.load(Ordering::SeqCst) {
        client.run_once();
    }

    println!("\n=== Buckets ===\n");
    for bucket in client.buckets() {
        println!(
            "   {:<10} remaining {} of {} ({:?})",
            bucket.hash, bucket.remaining, bucket.limit, bucket.busy
        );
    }

    let metrics = client.metrics();
    println!("\n{}", metrics);
    println!("\n{} - {}", metrics.health_status(), metrics.health_status().suggested_action());

    client.shutdown();
}
