use std::fmt;

use k8s_openapi::api::core::v1::Pod;

/// Lifecycle phase reported by the kubelet in `status.phase`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Anything the kubelet reports outside the known set reads as `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, PodPhase::Pending | PodPhase::Running)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait PodExt {
    /// A pod without a reported phase has not been scheduled yet and reads as Pending.
    fn phase(&self) -> PodPhase;

    fn set_phase(&mut self, phase: PodPhase);
}

impl PodExt for Pod {
    fn phase(&self) -> PodPhase {
        self.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map(PodPhase::parse)
            .unwrap_or_default()
    }

    fn set_phase(&mut self, phase: PodPhase) {
        self.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_status_reads_as_pending() {
        let mut pod = Pod::default();
        assert_eq!(pod.phase(), PodPhase::Pending);

        pod.set_phase(PodPhase::Succeeded);
        assert_eq!(pod.phase(), PodPhase::Succeeded);
        assert!(pod.phase().is_terminal());
    }

    #[test]
    fn unrecognized_phase_is_unknown() {
        assert_eq!(PodPhase::parse("Evicted"), PodPhase::Unknown);
        assert!(!PodPhase::Unknown.is_active());
        assert!(PodPhase::Pending.is_active());
    }
}
