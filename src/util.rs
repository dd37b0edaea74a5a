//! Shared utility functions.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run synchronous store or git work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Shorten agent output for use in an attention reason, keeping the tail,
/// which is where agents put their conclusion.
pub fn tail_chars(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - max).collect();
    format!("...{tail}")
}
