//! The instrumentation hook API.
//!
//! Probes create events, report entry and exit of the operations they wrap,
//! and let the tracer handle sampling, context bookkeeping and reporting.
//! Nothing here returns an error to the probe: failures are logged and the
//! affected span simply goes missing from the trace.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::config::TracerConfig;
use crate::context;
use crate::error::{Result, TraceError};
use crate::event::{
    Event, EventHandle, KEY_ERROR_CLASS, KEY_ERROR_MSG, KEY_LABEL, KEY_LAYER, LABEL_ENTRY,
    LABEL_EXIT, LABEL_INFO, SpanState,
};
use crate::id::TraceIdentifier;
use crate::reporter::Reporter;
use crate::sampler::{Inbound, Sampler, TraceMode};

/// Empty metadata, for reports that carry nothing beyond the defaults.
pub const NO_METADATA: [(&str, Value); 0] = [];

/// Creates and reports events. Cheap to clone; clones share the sampler and reporter.
#[derive(Debug, Clone)]
pub struct Tracer {
    sampler: Arc<Sampler>,
    reporter: Arc<Reporter>,
}

impl Tracer {
    pub fn new(sampler: Sampler, reporter: Reporter) -> Self {
        Self {
            sampler: Arc::new(sampler),
            reporter: Arc::new(reporter),
        }
    }

    /// Build a tracer from configuration, opening the collector socket.
    pub fn from_config(config: &TracerConfig) -> Result<Self> {
        if let Some(err) = config.validate().into_iter().next() {
            return Err(TraceError::Config(err.to_string()));
        }

        let reporter = if config.reporter.enabled {
            Reporter::udp(&config.reporter.address())?
        } else {
            Reporter::disabled()
        };

        tracing::info!(
            mode = %config.trace_mode,
            rate = config.sample_rate,
            destination = %reporter.destination(),
            "Tracer configured"
        );
        Ok(Self::new(
            Sampler::new(config.trace_mode, config.sample_rate),
            reporter,
        ))
    }

    /// A tracer that samples nothing and reports nowhere.
    pub fn disabled() -> Self {
        Self::new(Sampler::new(TraceMode::Never, 0), Reporter::disabled())
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Create an event continuing `parent`, or a new trace root.
    ///
    /// Only roots consult the sampler; children copy their parent's decision.
    pub fn create_event(&self, parent: Option<&Event>) -> Event {
        self.create_event_from(parent.map(Event::handle))
    }

    /// Like [`Tracer::create_event`], from a context handle.
    pub fn create_event_from(&self, parent: Option<EventHandle>) -> Event {
        match parent {
            Some(parent) => Event::child_of(&parent),
            None => {
                let decision = self.sampler.should_sample(Inbound::None);
                Event::new(TraceIdentifier::root(decision.sampled), Vec::new(), decision)
            }
        }
    }

    /// Create an event continuing whatever is current in this continuation.
    pub fn create_event_from_current(&self) -> Event {
        self.create_event_from(context::current())
    }

    /// Create the first local event of a request that may carry an inbound header.
    ///
    /// A header that fails to decode is logged and treated as absent.
    pub fn continue_from(&self, header: Option<&str>) -> Event {
        let inbound = match header.map(TraceIdentifier::decode) {
            None => None,
            Some(Ok(id)) => Some(id),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Ignoring inbound trace header");
                let decision = self.sampler.should_sample(Inbound::Malformed);
                return Event::new(TraceIdentifier::root(decision.sampled), Vec::new(), decision);
            }
        };

        match inbound {
            Some(id) => {
                let decision = self.sampler.should_sample(Inbound::Continued {
                    sampled: id.is_sampled(),
                });
                Event::new(
                    id.continue_from(decision.sampled),
                    vec![id.op_id()],
                    decision,
                )
            }
            None => self.create_event_from(None),
        }
    }

    /// Report the start of a span: attach metadata, make the event current and send it.
    ///
    /// Returns whether a message was handed to the reporter.
    pub fn report_entry<K, V>(
        &self,
        event: &mut Event,
        metadata: impl IntoIterator<Item = (K, V)>,
    ) -> bool
    where
        K: Into<String>,
        V: Into<Value>,
    {
        if event.state() != SpanState::Created {
            tracing::debug!(op_id = %event.op_id(), state = ?event.state(), "Event already reported");
            return false;
        }

        event.add_all(metadata);
        if event.get(KEY_LABEL).is_none() {
            event.add_info(KEY_LABEL, LABEL_ENTRY);
        }
        event.set_state(SpanState::Entered);
        context::enter(event.handle());
        self.report(event)
    }

    /// Report the end of the span started by `entry`.
    ///
    /// Builds the exit event (linked to `entry` and to the latest event
    /// reported under it, same layer), restores the context that was current
    /// before `entry`, and sends the exit event.
    /// Returns `None` if the span had already ended.
    pub fn report_exit<K, V>(
        &self,
        entry: &mut Event,
        metadata: impl IntoIterator<Item = (K, V)>,
    ) -> Option<Event>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        if entry.state() == SpanState::Ended {
            tracing::debug!(op_id = %entry.op_id(), "Span already ended");
            return None;
        }

        let mut exit = Event::child_of(&entry.handle());
        if let Some(latest) = context::latest(entry.id()) {
            exit.add_edge(latest);
        }
        if let Some(layer) = entry.get(KEY_LAYER).cloned() {
            exit.add_info(KEY_LAYER, layer);
        }
        exit.add_info(KEY_LABEL, LABEL_EXIT);
        exit.add_all(metadata);

        // A mismatch has already been logged and the context reset.
        if context::exit(entry.id()).is_ok() {
            context::record(exit.op_id());
        }

        entry.set_state(SpanState::Ended);
        exit.set_state(SpanState::Ended);
        self.report(&exit);
        Some(exit)
    }

    /// Report an info event under the current span, if there is one.
    pub fn report_info<K, V>(&self, metadata: impl IntoIterator<Item = (K, V)>) -> Option<Event>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let parent = context::current()?;
        let mut event = Event::child_of(&parent);
        event.add_info(KEY_LABEL, LABEL_INFO);
        event.add_all(metadata);
        context::record(event.op_id());
        self.report(&event);
        Some(event)
    }

    /// Send an event if its trace is sampled.
    pub fn report(&self, event: &Event) -> bool {
        event.is_sampled() && self.reporter.send(event)
    }

    /// Header to propagate to downstream calls from the current continuation.
    pub fn outbound_header(&self) -> Option<String> {
        context::current().map(|handle| handle.id.encode())
    }

    /// Wrap `fut` in an entry/exit pair for `layer`, nested under the current span.
    pub async fn instrument<F: Future>(&self, layer: &str, fut: F) -> F::Output {
        let entry = self.create_event_from_current();
        self.run_layer(layer, entry, fut, |_| Vec::new()).await
    }

    /// Like [`Tracer::instrument`], recording `ErrorClass`/`ErrorMsg` on failure.
    pub async fn instrument_result<F, T, E>(
        &self,
        layer: &str,
        fut: F,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let entry = self.create_event_from_current();
        self.run_layer(layer, entry, fut, |output| match output {
            Ok(_) => Vec::new(),
            Err(e) => vec![
                (KEY_ERROR_CLASS, Value::from(short_type_name::<E>())),
                (KEY_ERROR_MSG, Value::from(e.to_string())),
            ],
        })
        .await
    }

    /// Run `fut` as the top span of a new request, continuing `header` if present.
    pub async fn instrument_request<F: Future>(
        &self,
        layer: &str,
        header: Option<&str>,
        fut: F,
    ) -> F::Output {
        let entry = self.continue_from(header);
        context::scope(self.run_layer(layer, entry, fut, |_| Vec::new())).await
    }

    async fn run_layer<F: Future>(
        &self,
        layer: &str,
        mut entry: Event,
        fut: F,
        exit_info: impl FnOnce(&F::Output) -> Vec<(&'static str, Value)>,
    ) -> F::Output {
        let (output, exit) = context::bind(context::capture(), async move {
            self.report_entry(&mut entry, [(KEY_LAYER, layer)]);
            let output = fut.await;
            let exit = self.report_exit(&mut entry, exit_info(&output));
            (output, exit)
        })
        .await;
        // The layer ran on its own copy; link its exit into the caller's span.
        if let Some(exit) = exit {
            context::record(exit.op_id());
        }
        output
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

static TRACER: OnceLock<Tracer> = OnceLock::new();

/// Install the process-wide tracer. Fails (returning it) if one is already installed.
pub fn install(tracer: Tracer) -> std::result::Result<(), Tracer> {
    TRACER.set(tracer)
}

/// The process-wide tracer, if installed.
pub fn tracer() -> Option<&'static Tracer> {
    TRACER.get()
}

/// Create an event with the process-wide tracer (None if not installed).
pub fn create_event(parent: Option<&Event>) -> Option<Event> {
    tracer().map(|t| t.create_event(parent))
}

/// Report entry with the process-wide tracer (no-op if not installed).
pub fn report_entry<K, V>(event: &mut Event, metadata: impl IntoIterator<Item = (K, V)>) -> bool
where
    K: Into<String>,
    V: Into<Value>,
{
    tracer().is_some_and(|t| t.report_entry(event, metadata))
}

/// Report exit with the process-wide tracer (no-op if not installed).
pub fn report_exit<K, V>(
    entry: &mut Event,
    metadata: impl IntoIterator<Item = (K, V)>,
) -> Option<Event>
where
    K: Into<String>,
    V: Into<Value>,
{
    tracer().and_then(|t| t.report_exit(entry, metadata))
}

/// The current event of the running continuation.
pub fn current() -> Option<EventHandle> {
    context::current()
}
