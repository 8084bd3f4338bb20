//! Audit sink that writes to `tracing`.

use crate::application::ports::{AuditEvent, AuditSink};

/// Target used for audit events.
pub const AUDIT_TARGET: &str = "abuse_gate::audit";

/// Writes every audit event as a structured `tracing` event.
///
/// Decision events are logged at `warn`, everything else at `info`. Route
/// the `abuse_gate::audit` target to durable storage in the subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    /// Create a new sink.
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for TracingAuditSink {
    fn log_event(&self, event: &AuditEvent) {
        match event {
            AuditEvent::Decision {
                timestamp,
                endpoint,
                identifier,
                decision,
                reason,
                score,
                flags,
            } => {
                tracing::warn!(
                    target: AUDIT_TARGET,
                    event = event.name(),
                    %timestamp,
                    endpoint = %endpoint,
                    identifier = %identifier,
                    decision = decision.as_str(),
                    reason = ?reason,
                    score,
                    flags = ?flags,
                    "Audit event"
                );
            }
            AuditEvent::SessionRotated {
                timestamp,
                from,
                to,
                rotation_count,
            } => {
                tracing::info!(
                    target: AUDIT_TARGET,
                    event = event.name(),
                    %timestamp,
                    from = %from,
                    to = %to,
                    rotation_count,
                    "Audit event"
                );
            }
            AuditEvent::SessionDestroyed {
                timestamp,
                session,
                cause,
            } => {
                tracing::info!(
                    target: AUDIT_TARGET,
                    event = event.name(),
                    %timestamp,
                    session = %session,
                    cause = %cause,
                    "Audit event"
                );
            }
            AuditEvent::SessionAuthenticated {
                timestamp,
                session,
                identity,
            } => {
                tracing::info!(
                    target: AUDIT_TARGET,
                    event = event.name(),
                    %timestamp,
                    session = %session,
                    identity = %identity,
                    "Audit event"
                );
            }
            AuditEvent::SessionCreated { timestamp, session } => {
                tracing::info!(
                    target: AUDIT_TARGET,
                    event = event.name(),
                    %timestamp,
                    session = %session,
                    "Audit event"
                );
            }
            AuditEvent::PolicyUpdated {
                timestamp,
                endpoint,
            } => {
                tracing::info!(
                    target: AUDIT_TARGET,
                    event = event.name(),
                    %timestamp,
                    endpoint = %endpoint,
                    "Audit event"
                );
            }
            AuditEvent::IdentifierCleared {
                timestamp,
                identifier,
            } => {
                tracing::info!(
                    target: AUDIT_TARGET,
                    event = event.name(),
                    %timestamp,
                    identifier = %identifier,
                    "Audit event"
                );
            }
        }
    }
}
