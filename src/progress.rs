use std::path::Path;

use crate::state::{BatchedData, ModelState};

pub type RenderError = Box<dyn std::error::Error + Send + Sync>;

/// Hook invoked right after each snapshot is saved, for plotting or any
/// other side-channel reporting.
///
/// A render failure is downgraded to an advisory; it never stops the fit.
pub trait ProgressRenderer {
    fn render(
        &mut self,
        model: &ModelState,
        data: &BatchedData,
        checkpoint_path: &Path,
        iteration: u64,
        project_dir: &Path,
        run_name: &str,
    ) -> std::result::Result<(), RenderError>;
}
