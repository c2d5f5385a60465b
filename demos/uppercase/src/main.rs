//! Uppercase Demo
//!
//! Registers a request handler that reads `{"text": ...}` messages from
//! `text.requests`, uppercases the text, and publishes the result to
//! `text.results`. A timing behavior wraps the handler. An audit handler
//! listens on the `text.audit` topic with one anonymous queue per instance,
//! so every broadcast is logged once per instance.
//!
//! # Usage
//!
//! ```bash
//! cargo run --package uppercase-demo -- --instances 3 hello wyrm
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wyrm::prelude::*;

#[derive(Parser, Debug)]
#[command(about = "Uppercase text messages through the Wyrm pipeline")]
struct Args {
    /// Worker instances per handler.
    #[arg(short, long, default_value_t = 2)]
    instances: usize,

    /// Texts to send. Defaults to "hello".
    texts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TextMessage {
    text: String,
}

// ============================================================================
// Handlers
// ============================================================================

struct Uppercase;

#[async_trait]
impl RequestHandler for Uppercase {
    type Input = Json<TextMessage>;
    type Output = Json<TextMessage>;

    async fn handle(
        &self,
        input: Option<Json<TextMessage>>,
        ctx: &MessageContext,
    ) -> Result<Json<TextMessage>, BoxError> {
        let Json(message) = input.ok_or("empty message")?;
        info!(queue = ctx.queue(), text = %message.text, "Uppercasing");
        Ok(Json(TextMessage {
            text: message.text.to_uppercase(),
        }))
    }
}

/// Logs every result broadcast on the `text.audit` topic.
struct Audit;

#[async_trait]
impl EventHandler for Audit {
    type Input = String;

    async fn handle(&self, input: Option<String>, ctx: &MessageContext) -> Result<(), BoxError> {
        info!(queue = ctx.queue(), entry = ?input, "Audit entry");
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let texts = if args.texts.is_empty() {
        vec!["hello".to_string()]
    } else {
        args.texts
    };

    let broker = InMemoryBroker::new();
    let runtime = WyrmRuntime::builder()
        .broker(Arc::new(broker.clone()))
        .build()
        .context("failed to build runtime")?;

    let timing = from_fn(|ctx, next| async move {
        let started = Instant::now();
        let result = call_next(next, ctx).await;
        info!(elapsed = ?started.elapsed(), "Message processed");
        result
    });

    runtime
        .register_request_handler(
            "uppercase",
            Uppercase,
            [
                EventBinding::queue("text.requests"),
                EventBinding::queue("text.results").outbound(),
            ],
            HandlerOptions::new().instances(args.instances).before(timing),
        )
        .await?;
    runtime
        .register_event_handler(
            "audit",
            Audit,
            [EventBinding::topic("text.audit")],
            HandlerOptions::new().instances(args.instances),
        )
        .await?;
    runtime.start().await?;

    for (i, text) in texts.iter().enumerate() {
        let body = serde_json::to_vec(&TextMessage { text: text.clone() })?;
        let headers = Headers::new().with("correlation-id", format!("demo-{i}"));
        broker.send("text.requests", body, headers)?;
        broker
            .publish(
                &Binding::Topic("text.audit".into()),
                text.clone().into_bytes(),
                Box::new(|_| {}),
            )
            .await?;
    }

    let expected = texts.len();
    let deadline = Instant::now() + Duration::from_secs(5);
    while broker.queue_len("text.results").unwrap_or(0) < expected {
        if Instant::now() > deadline {
            runtime.stop().await;
            bail!("timed out waiting for {expected} results");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for delivery in broker.drain("text.results") {
        let message: TextMessage = serde_json::from_slice(&delivery.body)?;
        println!(
            "{} -> {}",
            delivery.headers.get_str("correlation-id").unwrap_or("?"),
            message.text
        );
    }

    if !runtime.stop().await {
        warn!("Some messages were still in flight at shutdown");
    }
    Ok(())
}
