//! Framework adapter integration tests
//!
//! A framework adapter is a thin translator between the framework's
//! dispatch hooks and the tracer. These tests drive a small route-dispatch
//! adapter and the process-wide entry points the way a framework integration would.

use std::collections::HashMap;
use std::future::Future;
use std::net::UdpSocket;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use traceview_core::event::{KEY_LABEL, KEY_LAYER};
use traceview_core::message::MAX_MESSAGE_SIZE;
use traceview_core::{
    MAX_SAMPLE_RATE, NO_METADATA, ReceivedMessage, Reporter, Sampler, TraceMode, Tracer, context,
};

type Response = Pin<Box<dyn Future<Output = u16> + Send>>;
type Handler = Arc<dyn Fn() -> Response + Send + Sync>;

/// Route-dispatch adapter: reports a `koa-route` span around each controller.
struct RouteAdapter {
    tracer: Tracer,
    enabled: bool,
    routes: HashMap<String, (String, Handler)>,
}

impl RouteAdapter {
    fn new(tracer: Tracer) -> Self {
        Self {
            tracer,
            enabled: true,
            routes: HashMap::new(),
        }
    }

    fn get(&mut self, path: &str, controller: &str, handler: Handler) {
        self.routes
            .insert(path.to_string(), (controller.to_string(), handler));
    }

    async fn dispatch(&self, path: &str) -> u16 {
        let Some((controller, handler)) = self.routes.get(path) else {
            return 404;
        };
        if !self.enabled {
            return handler().await;
        }

        let mut entry = self.tracer.create_event_from_current();
        self.tracer.report_entry(
            &mut entry,
            [
                (KEY_LAYER, "koa-route"),
                ("Controller", controller.as_str()),
                ("Action", path),
            ],
        );
        let status = context::bind(context::capture(), handler()).await;
        self.tracer.report_exit(&mut entry, [("Status", status)]);
        status
    }
}

fn collector() -> (UdpSocket, String) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    (socket, addr)
}

fn drain(socket: &UdpSocket) -> Vec<ReceivedMessage> {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let mut msgs = Vec::new();
    while let Ok(n) = socket.recv(&mut buf) {
        msgs.push(ReceivedMessage::parse(&buf[..n]).unwrap());
    }
    msgs
}

fn hello() -> Handler {
    Arc::new(|| -> Response { Box::pin(async { 200 }) })
}

#[tokio::test]
async fn test_route_adapter_reports_controller_span() {
    let (socket, addr) = collector();
    let tracer = Tracer::new(
        Sampler::new(TraceMode::Always, MAX_SAMPLE_RATE),
        Reporter::udp(&addr).unwrap(),
    );
    let mut adapter = RouteAdapter::new(tracer.clone());
    adapter.get("/hello/:name", "hello", hello());

    let status = tracer
        .instrument_request("koa", None, adapter.dispatch("/hello/:name"))
        .await;
    assert_eq!(status, 200);

    let msgs = drain(&socket);
    let labels: Vec<_> = msgs
        .iter()
        .map(|m| (m.get_str(KEY_LAYER).unwrap(), m.get_str(KEY_LABEL).unwrap()))
        .collect();
    assert_eq!(
        labels,
        vec![
            ("koa", "entry"),
            ("koa-route", "entry"),
            ("koa-route", "exit"),
            ("koa", "exit"),
        ]
    );
    assert_eq!(msgs[1].get_str("Controller"), Some("hello"));
    assert_eq!(msgs[1].get_str("Action"), Some("/hello/:name"));
    assert_eq!(msgs[2].get("Status"), Some(&serde_json::Value::from(200)));
    assert_eq!(msgs[1].edges, vec![msgs[0].id.op_id()]);
}

#[tokio::test]
async fn test_route_adapter_skips_when_disabled() {
    let (socket, addr) = collector();
    let tracer = Tracer::new(
        Sampler::new(TraceMode::Always, MAX_SAMPLE_RATE),
        Reporter::udp(&addr).unwrap(),
    );
    let mut adapter = RouteAdapter::new(tracer.clone());
    adapter.enabled = false;
    adapter.get("/hello/:name", "hello", hello());

    let status = tracer
        .instrument_request("koa", None, adapter.dispatch("/hello/:name"))
        .await;
    assert_eq!(status, 200);

    let msgs = drain(&socket);
    assert_eq!(msgs.len(), 2);
    assert!(msgs.iter().all(|m| m.get_str(KEY_LAYER) == Some("koa")));
}

#[test]
#[serial]
fn test_process_wide_tracer() {
    let (socket, addr) = collector();

    // Before installation the free functions are inert.
    if traceview_core::tracer().is_none() {
        assert!(traceview_core::create_event(None).is_none());
    }

    let tracer = Tracer::new(
        Sampler::new(TraceMode::Always, MAX_SAMPLE_RATE),
        Reporter::udp(&addr).unwrap(),
    );
    assert!(traceview_core::install(tracer).is_ok());
    assert!(traceview_core::install(Tracer::disabled()).is_err());

    context::run_with(context::Context::new(), || {
        let mut entry = traceview_core::create_event(None).unwrap();
        assert!(traceview_core::report_entry(&mut entry, [(KEY_LAYER, "fs")]));
        assert_eq!(traceview_core::current().map(|h| h.id), Some(*entry.id()));

        let exit = traceview_core::report_exit(&mut entry, NO_METADATA).unwrap();
        assert!(traceview_core::current().is_none());

        let msgs = drain(&socket);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].id, *entry.id());
        assert_eq!(msgs[1].id, *exit.id());
    });
}
