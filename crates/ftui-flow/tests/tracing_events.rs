//! Structured logging emitted by the propagation core.
//!
//! Validates:
//! 1. Transaction open/close are logged at DEBUG.
//! 2. Per-entry drain events appear only when `trace_entries` is set.
//! 3. Rank overflow and abandoned transactions are logged at WARN.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Arc, Mutex};

use ftui_flow::{FlowConfig, Holder, Node, Partition, SimplePolicy, with_transaction};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::{EnvFilter, Registry};

type Events = Arc<Mutex<Vec<(Level, String)>>>;

struct Recorder {
    events: Events,
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for Recorder {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.0));
    }
}

fn capture(f: impl FnOnce()) -> Vec<(Level, String)> {
    let events = Events::default();
    let subscriber = Registry::default()
        .with(EnvFilter::new("ftui_flow=trace"))
        .with(Recorder {
            events: Arc::clone(&events),
        });
    tracing::subscriber::with_default(subscriber, f);
    let events = events.lock().unwrap().clone();
    events
}

fn has(events: &[(Level, String)], level: Level, message: &str) -> bool {
    events.iter().any(|(l, m)| *l == level && m == message)
}

fn fire_once(config: FlowConfig) {
    let partition = Partition::new("tracing", config, Arc::new(SimplePolicy));
    let (source, sink) = (Node::new(), Node::new());
    with_transaction(&partition, |tx| {
        tx.link(&source, &Holder::inert(), &sink).unwrap();
        source.send(tx, Arc::new(()));
    })
    .unwrap();
}

#[test]
fn transactions_are_logged_at_debug() {
    let events = capture(|| fire_once(FlowConfig::default()));
    assert!(has(&events, Level::DEBUG, "partition created"));
    assert!(has(&events, Level::DEBUG, "transaction opened"));
    assert!(has(&events, Level::DEBUG, "transaction closed"));
    assert!(!has(&events, Level::TRACE, "drain entry"));
}

#[test]
fn drain_entries_are_traced_when_enabled() {
    let events = capture(|| fire_once(FlowConfig::default().with_trace_entries(true)));
    assert!(has(&events, Level::TRACE, "drain entry"));
}

#[test]
fn rank_overflow_and_abandon_are_warnings() {
    let events = capture(|| {
        let a = Node::with_rank(3);
        let b = Node::new();
        assert!(a.link_with_limit(&Holder::inert(), &b, 4).is_err());

        let partition = Partition::with_defaults("tracing-abandon");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _tx = ftui_flow::Transaction::open(&partition).unwrap();
            panic!("owner failed");
        }));
        assert!(result.is_err());
    });
    assert!(has(&events, Level::WARN, "rank limit reached"));
    assert!(has(&events, Level::WARN, "transaction abandoned"));
}
