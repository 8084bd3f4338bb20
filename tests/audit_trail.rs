//! The default audit sink writes structured events to the audit target.

use abuse_gate::infrastructure::audit::AUDIT_TARGET;
use abuse_gate::{AbuseEngine, FingerprintSignals, RequestContext};
use chrono::Utc;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

/// Layer that keeps the level and `event` field of audit-target events.
#[derive(Clone, Default)]
struct AuditCapture {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl AuditCapture {
    fn events(&self) -> Vec<(Level, String)> {
        self.events.lock().unwrap().clone()
    }
}

struct EventName(Option<String>);

impl Visit for EventName {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "event" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

impl<S: Subscriber> Layer<S> for AuditCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != AUDIT_TARGET {
            return;
        }
        let mut name = EventName(None);
        event.record(&mut name);
        if let Some(name) = name.0 {
            self.events
                .lock()
                .unwrap()
                .push((*event.metadata().level(), name));
        }
    }
}

fn request(identity: &str, origin: &str) -> RequestContext {
    RequestContext::new(
        "code-delivery",
        identity,
        origin.parse().unwrap(),
        FingerprintSignals::new("Mozilla/5.0 (X11; Linux x86_64)"),
        Utc::now(),
    )
}

#[test]
fn test_decisions_and_sessions_reach_audit_target() {
    let capture = AuditCapture::default();
    let subscriber = tracing_subscriber::registry()
        .with(capture.clone())
        .with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_filter(EnvFilter::new("abuse_gate=debug")),
        );

    tracing::subscriber::with_default(subscriber, || {
        let engine = AbuseEngine::builder().build().unwrap();

        // Clean request: no audit event
        engine.assess(&request("+33612480931", "81.2.69.160")).unwrap();
        // Private origin with a disposable number: denied and audited
        engine.assess(&request("+33600000001", "10.0.0.5")).unwrap();

        let fingerprint = engine
            .fingerprint(&FingerprintSignals::new("Mozilla/5.0"))
            .unwrap();
        let issued = engine
            .create_session("81.2.69.160".parse().unwrap(), &fingerprint)
            .unwrap();
        engine.destroy_session(&issued.token).unwrap();
    });

    assert_eq!(
        capture.events(),
        vec![
            (Level::WARN, "decision".to_string()),
            (Level::INFO, "session_created".to_string()),
            (Level::INFO, "session_destroyed".to_string()),
        ]
    );
}

#[test]
fn test_audit_target_can_be_filtered_out() {
    let capture = AuditCapture::default();
    let subscriber = tracing_subscriber::registry()
        .with(capture.clone().with_filter(EnvFilter::new("abuse_gate::audit=off,abuse_gate=info")));

    tracing::subscriber::with_default(subscriber, || {
        let engine = AbuseEngine::builder().build().unwrap();
        engine.assess(&request("+33600000001", "10.0.0.5")).unwrap();
    });

    assert!(capture.events().is_empty());
}
