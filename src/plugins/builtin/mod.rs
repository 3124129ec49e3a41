//! Plugins shipped with firmflow

use super::AnalysisPlugin;
use std::sync::Arc;

mod entropy;
mod file_hashes;
mod file_type;
mod printable_strings;

pub use entropy::{EntropyPlugin, shannon_entropy};
pub use file_hashes::FileHashesPlugin;
pub use file_type::FileTypePlugin;
pub use printable_strings::PrintableStringsPlugin;

pub fn all() -> Vec<Arc<dyn AnalysisPlugin>> {
    vec![
        Arc::new(FileTypePlugin::new()),
        Arc::new(FileHashesPlugin::new()),
        Arc::new(EntropyPlugin::new()),
        Arc::new(PrintableStringsPlugin::new()),
    ]
}
