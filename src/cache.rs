//! Process-wide cache of compiled routines.
//!
//! Keyed by the textual fingerprint (expression + options + all formats).
//! One mutex serialises lookup and insertion; a compile in flight holds the
//! lock, so a second filter asking for the same fingerprint waits and then
//! hits. Entries are never evicted — the set of distinct expressions in a
//! pipeline is small and routines are cheap to keep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::Result;
use crate::jit::CompiledRoutine;

static CACHE: OnceLock<Mutex<HashMap<String, Arc<CompiledRoutine>>>> = OnceLock::new();

/// Look up `key`, compiling and publishing on miss. Failed compiles are not
/// cached; the error propagates to the caller.
pub(crate) fn get_or_compile(
    key: &str,
    build: impl FnOnce() -> Result<CompiledRoutine>,
) -> Result<Arc<CompiledRoutine>> {
    let cache = CACHE.get_or_init(Default::default);
    let mut map = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(hit) = map.get(key) {
        log::trace!("routine cache hit: {key}");
        return Ok(Arc::clone(hit));
    }
    log::debug!("routine cache miss: {key}");
    let routine = Arc::new(build()?);
    map.insert(key.to_owned(), Arc::clone(&routine));
    Ok(routine)
}
