use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;

pub(crate) const DEFAULT_LOCATION: &str = "/etc/cloudio/default.cfg";

/// Locate the configuration profile.
///
/// Resolution order:
/// 1. the explicit `--profile` path, when given and readable;
/// 2. `$CLOUDIOPATH/$CLOUDIOCONFIG`, falling back to
///    `$CLOUDIOPATH/cloudio.cfg` when `CLOUDIOCONFIG` is unset;
/// 3. `/etc/cloudio/default.cfg`.
///
/// Returns `ProfileNotFound` when none of the three exists; the binary
/// turns that into exit code 2.
pub fn locate_profile(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.exists() {
            debug!(path = %path.display(), "using profile from --profile");
            return Ok(path.to_path_buf());
        }
    }

    if let Ok(root) = std::env::var("CLOUDIOPATH") {
        let file = std::env::var("CLOUDIOCONFIG").unwrap_or_else(|_| "cloudio.cfg".to_string());
        let candidate = Path::new(&root).join(file);
        if candidate.exists() {
            debug!(path = %candidate.display(), "using profile from CLOUDIOPATH");
            return Ok(candidate);
        }
    }

    let fallback = Path::new(DEFAULT_LOCATION);
    if fallback.exists() {
        debug!(path = %fallback.display(), "using default profile location");
        return Ok(fallback.to_path_buf());
    }

    Err(ConfigError::ProfileNotFound)
}
