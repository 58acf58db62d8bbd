use tracing::{info, trace};

/// Receives package download progress, e.g. for a splash window.
pub trait ProgressReporter {
    fn set_label(&mut self, label: &str);

    /// `fraction` is in `0.0..=1.0`.
    fn set_progress(&mut self, fraction: f64);
}

#[derive(Debug, Default)]
pub struct TracingProgress {
    label: String,
}

impl ProgressReporter for TracingProgress {
    fn set_label(&mut self, label: &str) {
        if self.label != label {
            self.label = label.to_string();
            info!("{}", label);
        }
    }

    fn set_progress(&mut self, fraction: f64) {
        trace!(label = %self.label, percent = (fraction * 100.0).round(), "progress");
    }
}
