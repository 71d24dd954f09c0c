//! Demo trace emitter.
//!
//! Simulates a request handled by a route-dispatch layer that fans out into
//! nested layers on spawned continuations, so a collector receives a
//! realistic edge graph.

use std::time::Duration;

use traceview_core::{Tracer, context};

/// Summary of one emitted trace.
#[derive(Debug)]
pub struct Emitted {
    pub header: Option<String>,
    pub sampled: bool,
}

async fn simulate_query(tracer: &Tracer, n: u32) {
    tracer
        .instrument("postgres", async {
            tracer.report_info([("Query", format!("SELECT * FROM items WHERE id = {n}"))]);
            tokio::time::sleep(Duration::from_millis(2)).await;
        })
        .await;
}

async fn simulate_layer(tracer: &Tracer, depth: u32) {
    if depth == 0 {
        simulate_query(tracer, 0).await;
        return;
    }

    let layer = format!("middleware-{depth}");
    Box::pin(tracer.instrument(&layer, async {
        // Fan out on a separate continuation; it keeps this layer's context.
        let child = tracer.clone();
        let handle = context::spawn(async move { simulate_query(&child, depth).await });
        simulate_layer(tracer, depth - 1).await;
        if let Err(e) = handle.await {
            tracing::warn!("Continuation failed: {}", e);
        }
    }))
    .await;
}

/// Emit one demo trace of the given nesting depth.
pub async fn emit(tracer: &Tracer, layer: &str, depth: u32, inbound: Option<&str>) -> Emitted {
    let header = tracer
        .instrument_request(layer, inbound, async {
            tracer.report_info([("URL", "/items/42"), ("Method", "GET")]);
            simulate_layer(tracer, depth).await;
            tracer.outbound_header()
        })
        .await;

    Emitted {
        sampled: header
            .as_deref()
            .and_then(|h| h.parse::<traceview_core::TraceIdentifier>().ok())
            .is_some_and(|id| id.is_sampled()),
        header,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use traceview_core::{
        MAX_SAMPLE_RATE, MemoryTransport, ReceivedMessage, Reporter, Sampler, TraceMode,
    };

    #[tokio::test]
    async fn test_emit_builds_connected_trace() {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = Tracer::new(
            Sampler::new(TraceMode::Always, MAX_SAMPLE_RATE),
            Reporter::new(Arc::clone(&transport)),
        );

        let emitted = emit(&tracer, "koa-route", 2, None).await;
        assert!(emitted.sampled);

        let msgs: Vec<ReceivedMessage> = transport
            .take()
            .iter()
            .map(|p| ReceivedMessage::parse(p).unwrap())
            .collect();
        // request entry/exit + info, 2 middleware entry/exit, 3 queries x (entry, info, exit)
        assert_eq!(msgs.len(), 2 + 1 + 4 + 9);

        let task = msgs[0].id.task_id();
        assert!(msgs.iter().all(|m| m.id.task_id() == task));

        // Every edge points at an op reported earlier in the same trace.
        let ops: HashSet<_> = msgs.iter().map(|m| m.id.op_id()).collect();
        assert!(msgs[1..].iter().all(|m| m.edges.iter().all(|e| ops.contains(e))));
    }

    #[tokio::test]
    async fn test_emit_through_without_header_reports_nothing() {
        let transport = Arc::new(MemoryTransport::new());
        let tracer = Tracer::new(
            Sampler::new(TraceMode::Through, MAX_SAMPLE_RATE),
            Reporter::new(Arc::clone(&transport)),
        );

        let emitted = emit(&tracer, "koa-route", 1, None).await;
        assert!(!emitted.sampled);
        assert!(emitted.header.is_some());
        assert!(transport.payloads().is_empty());
    }
}
