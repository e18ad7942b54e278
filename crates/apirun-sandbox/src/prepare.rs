//! Pre-execution checks and the `export default` rewrite.

use std::time::Duration;

use crate::error::ScriptError;

/// Global binding the default export is assigned to.
pub const DEFAULT_EXPORT_BINDING: &str = "__api_default__";

/// Default maximum script size in bytes (1 MiB).
pub const DEFAULT_MAX_SCRIPT_SIZE: usize = 1024 * 1024;

const EXPORT_DEFAULT: &str = "export default";
const EXPORT_ASSIGNMENT: &str = "globalThis.__api_default__ =";

/// Reject scripts that cannot possibly run.
pub fn validate_script(script: &str, max_size: usize) -> Result<(), ScriptError> {
    if script.len() > max_size {
        return Err(ScriptError::ScriptTooLarge {
            max: max_size,
            actual: script.len(),
        });
    }
    if script.trim().is_empty() {
        return Err(ScriptError::EmptyScript);
    }
    Ok(())
}

/// Rewrite the first `export default` into an assignment to the well-known
/// global. Scripts without one are returned unchanged.
pub fn prepare_script(script: &str) -> String {
    script.replacen(EXPORT_DEFAULT, EXPORT_ASSIGNMENT, 1)
}

/// Truncate to whole seconds, never below one.
pub fn normalize_timeout(timeout: Duration) -> Duration {
    Duration::from_secs(timeout.as_secs().max(1))
}
