use install_core::{OperationKey, Phase};
use tracing::Span;

/// Diagnostics handle of one phase executor.
///
/// Wraps a span carrying the phase id, the target node and the operation
/// key, so every event logged in it can be traced back to its phase.
#[derive(Debug, Clone)]
pub struct PhaseLogger {
    span: Span,
}

impl PhaseLogger {
    pub fn new(phase: &Phase, key: &OperationKey) -> Self {
        let (advertise_ip, hostname) = phase
            .data
            .server
            .as_ref()
            .map(|s| (s.advertise_ip.as_str(), s.hostname.as_str()))
            .unwrap_or_default();

        let span = tracing::info_span!(
            "phase",
            phase = %phase.id,
            advertise_ip = %advertise_ip,
            hostname = %hostname,
            key = %key,
        );
        Self { span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn info(&self, message: &str) {
        self.span.in_scope(|| tracing::info!("{}", message));
    }

    pub fn debug(&self, message: &str) {
        self.span.in_scope(|| tracing::debug!("{}", message));
    }

    pub fn warn(&self, message: &str) {
        self.span.in_scope(|| tracing::warn!("{}", message));
    }
}
