//! Cross-crate end-to-end tests
//!
//! These tests run the tracer against a real loopback UDP collector and
//! check what arrives on the wire.

use std::net::UdpSocket;
use std::time::Duration;

use traceview_core::event::{KEY_LABEL, KEY_LAYER};
use traceview_core::message::MAX_MESSAGE_SIZE;
use traceview_core::{
    MAX_SAMPLE_RATE, NO_METADATA, ReceivedMessage, Reporter, SampleSource, Sampler,
    TraceIdentifier, TraceMode, Tracer, context,
};

/// A loopback collector capturing datagrams.
struct Collector {
    socket: UdpSocket,
}

impl Collector {
    fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        Self { socket }
    }

    fn address(&self) -> String {
        self.socket.local_addr().unwrap().to_string()
    }

    fn tracer(&self, mode: TraceMode) -> Tracer {
        Tracer::new(
            Sampler::new(mode, MAX_SAMPLE_RATE),
            Reporter::udp(&self.address()).unwrap(),
        )
    }

    fn recv(&self) -> ReceivedMessage {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let n = self.socket.recv(&mut buf).unwrap();
        ReceivedMessage::parse(&buf[..n]).unwrap()
    }

    fn recv_n(&self, n: usize) -> Vec<ReceivedMessage> {
        (0..n).map(|_| self.recv()).collect()
    }

    /// Assert nothing else arrives within a short window.
    fn assert_quiet(&self) {
        self.socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        assert!(self.socket.recv(&mut buf).is_err(), "unexpected message");
    }
}

/// E2E Test: one root event reported in always mode
///
/// Exactly one message arrives and its identifier matches the event.
#[test]
fn test_e2e_report_entry_sends_one_message() {
    let collector = Collector::start();
    let tracer = collector.tracer(TraceMode::Always);

    let mut event = tracer.create_event(None);
    assert!(tracer.report_entry(&mut event, NO_METADATA));

    let msg = collector.recv();
    assert_eq!(msg.id.task_id(), event.task_id());
    assert_eq!(msg.id.to_string(), event.to_string());
    assert_eq!(msg.get_str(KEY_LABEL), Some("entry"));
    collector.assert_quiet();
}

/// E2E Test: never mode reports nothing but the request still runs
#[tokio::test]
async fn test_e2e_never_mode_is_silent() {
    let collector = Collector::start();
    let tracer = collector.tracer(TraceMode::Never);

    let out = tracer
        .instrument_request("http", None, async {
            tracer.instrument("db", async { "rows" }).await
        })
        .await;
    assert_eq!(out, "rows");
    assert_eq!(tracer.reporter().stats().sent, 0);
    collector.assert_quiet();
}

/// E2E Test: a sampled inbound header is continued, not redrawn
#[tokio::test]
async fn test_e2e_through_mode_continues_upstream_trace() {
    let collector = Collector::start();
    let tracer = collector.tracer(TraceMode::Through);
    let upstream = TraceIdentifier::root(true);
    let header = upstream.encode();

    tracer
        .instrument_request("http", Some(&header), async {})
        .await;

    let msgs = collector.recv_n(2);
    assert!(msgs.iter().all(|m| m.id.task_id() == upstream.task_id()));
    assert!(msgs.iter().all(|m| m.id.is_sampled()));
    assert_eq!(msgs[0].edges, vec![upstream.op_id()]);
    assert_eq!(tracer.sampler().decisions_made(), 1);

    // No header at all: through mode never starts a trace.
    tracer.instrument_request("http", None, async {}).await;
    // Unsampled upstream: inherited as unsampled.
    let unsampled = TraceIdentifier::root(false).encode();
    tracer
        .instrument_request("http", Some(&unsampled), async {})
        .await;
    collector.assert_quiet();
}

/// E2E Test: a malformed inbound header falls back to a fresh root
#[tokio::test]
async fn test_e2e_malformed_header_is_not_continued() {
    let collector = Collector::start();
    let tracer = collector.tracer(TraceMode::Always);

    tracer
        .instrument_request("http", Some("2B-garbage"), async {})
        .await;

    let msgs = collector.recv_n(2);
    assert!(msgs[0].edges.is_empty());
    assert_eq!(msgs[1].edges, vec![msgs[0].id.op_id()]);
}

/// E2E Test: continuations scheduled from two interleaved requests
///
/// Each deferred continuation reports under the request that scheduled it,
/// even though the other request's continuations run in between.
#[tokio::test(flavor = "current_thread")]
async fn test_e2e_interleaved_continuations_link_to_their_own_trace() {
    let collector = Collector::start();
    let tracer = collector.tracer(TraceMode::Always);

    let request = |name: &'static str, delay_ms: u64| {
        let tracer = tracer.clone();
        tokio::spawn(async move {
            tracer
                .instrument_request(name, None, async {
                    let entry = context::current().unwrap();
                    let timer = {
                        let tracer = tracer.clone();
                        context::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            tracer.report_info([("Timer", delay_ms)]);
                            context::current().unwrap()
                        })
                    };
                    tokio::task::yield_now().await;
                    let seen = timer.await.unwrap();
                    (entry, seen)
                })
                .await
        })
    };

    let slow = request("slow", 30);
    let fast = request("fast", 5);
    let (slow_entry, slow_seen) = slow.await.unwrap();
    let (fast_entry, fast_seen) = fast.await.unwrap();

    assert_eq!(slow_seen, slow_entry);
    assert_eq!(fast_seen, fast_entry);
    assert_ne!(slow_entry.id.task_id(), fast_entry.id.task_id());

    // 2 x (entry, timer info, exit)
    let msgs = collector.recv_n(6);
    for (entry, delay) in [(slow_entry, 30), (fast_entry, 5)] {
        let info = msgs
            .iter()
            .find(|m| m.get("Timer") == Some(&serde_json::Value::from(delay)))
            .unwrap();
        assert_eq!(info.id.task_id(), entry.id.task_id());
        assert_eq!(info.edges, vec![entry.id.op_id()]);
    }
}

/// E2E Test: sample decisions are made once per trace, however many
/// continuations and nested layers it spawns
#[tokio::test]
async fn test_e2e_descendants_share_root_decision() {
    let collector = Collector::start();
    let tracer = Tracer::new(
        Sampler::new(TraceMode::Rate, MAX_SAMPLE_RATE / 2),
        Reporter::udp(&collector.address()).unwrap(),
    );
    let sampler_before = tracer.sampler().decisions_made();

    let decisions = tracer
        .instrument_request("http", None, async {
            let mut handles = Vec::new();
            for _ in 0..5 {
                let tracer = tracer.clone();
                handles.push(context::spawn(async move {
                    tracer
                        .instrument("worker", async { context::current().unwrap().decision })
                        .await
                }));
            }
            let mut decisions = Vec::new();
            for handle in handles {
                decisions.push(handle.await.unwrap());
            }
            decisions
        })
        .await;

    assert_eq!(tracer.sampler().decisions_made(), sampler_before + 1);
    assert!(decisions.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(decisions[0].source, SampleSource::Rate);
}

/// E2E Test: refused sends are dropped and counted, never raised
///
/// Once the kernel has seen the ICMP port-unreachable for the first
/// datagram, later sends on the connected socket fail and are dropped,
/// while span bookkeeping carries on as if nothing happened.
#[test]
fn test_e2e_refused_sends_are_counted_as_dropped() {
    // Bind and drop to get a port nobody listens on.
    let port = UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let tracer = Tracer::new(
        Sampler::new(TraceMode::Always, MAX_SAMPLE_RATE),
        Reporter::udp(&format!("127.0.0.1:{port}")).unwrap(),
    );

    let mut first = tracer.create_event(None);
    tracer.report_entry(&mut first, [(KEY_LAYER, "http")]);
    std::thread::sleep(Duration::from_millis(50));

    for _ in 0..20 {
        let mut entry = tracer.create_event(None);
        tracer.report_entry(&mut entry, [(KEY_LAYER, "http")]);
        let exit = tracer.report_exit(&mut entry, NO_METADATA);
        assert!(exit.is_some_and(|e| e.edges() == [entry.op_id()]));
    }

    let stats = tracer.reporter().stats();
    assert_eq!(stats.sent + stats.dropped, 41);
    assert!(stats.dropped > 0, "no send was refused: {stats:?}");
}

/// E2E Test: the collector can be changed while the tracer is in use
#[test]
fn test_e2e_retarget_collector_at_runtime() {
    let (a, b) = (Collector::start(), Collector::start());
    let tracer = a.tracer(TraceMode::Always);

    let mut event = tracer.create_event(None);
    tracer.report_entry(&mut event, NO_METADATA);
    assert_eq!(a.recv().id, *event.id());

    // A bad address leaves delivery to the current collector intact.
    assert!(tracer.reporter().set_address(":0").is_err());
    let exit = tracer.report_exit(&mut event, NO_METADATA).unwrap();
    assert_eq!(a.recv().id, *exit.id());

    tracer.reporter().set_address(&b.address()).unwrap();
    assert_eq!(tracer.reporter().address(), Some(b.address()));

    let mut next = tracer.create_event(None);
    tracer.report_entry(&mut next, NO_METADATA);
    assert_eq!(b.recv().id, *next.id());
    a.assert_quiet();
}
