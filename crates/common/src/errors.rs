use errors::ErrorBodyAnyhowExt;
use tracing::Level;

use crate::metrics::log_error_reported;

/// Log an error at the level it carries and count it. The taxonomy's default
/// is error-level for unclassified chains, warn for protocol errors.
pub fn report_error(e: &mut anyhow::Error) {
    let level = e.log_level();
    if level == Level::INFO || level == Level::DEBUG || level == Level::TRACE {
        tracing::info!("{e:#}");
    } else if level == Level::WARN {
        tracing::warn!("{e:#}");
    } else {
        tracing::error!("{e:#}");
    }
    let kind = e.error_body().map(|body| body.kind);
    log_error_reported(kind);
}
