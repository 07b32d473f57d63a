use dotenvy::dotenv;
use tracing::{debug, warn};

/// Exports the variables of a `.env` file in the working directory or one of
/// its parents, so `CHAIN_FOLLOWER_*` options can live there.
///
/// A missing or unreadable file is skipped silently. A file that does not
/// parse is skipped with a warning.
pub fn load_dotenvy_vars_if_present() {
    match dotenv() {
        Ok(path) => debug!(path = %path.display(), "loaded environment file"),
        Err(dotenvy::Error::Io(_)) => (),
        Err(err) => warn!(%err, "found an environment file but could not parse it"),
    }
}
