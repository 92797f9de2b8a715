//! Scope routing: map a work item's scope path to the cell that owns it.

use crate::errors::RigError;
use crate::store::Cell;

/// Return the cell with the longest `scope_prefix` that is a string prefix of
/// `scope`. Ties go to the cell listed first. `None` means no cell owns it.
///
/// Leading `/` is ignored on both sides, so `""` and `"/"` are both
/// catch-all prefixes.
pub fn route<'a>(scope: &str, cells: &'a [Cell]) -> Option<&'a Cell> {
    let scope = scope.trim_start_matches('/');
    let mut best: Option<(&Cell, usize)> = None;
    for cell in cells {
        let prefix = cell.scope_prefix.trim_start_matches('/');
        if !scope.starts_with(prefix) {
            continue;
        }
        if best.is_none_or(|(_, len)| prefix.len() > len) {
            best = Some((cell, prefix.len()));
        }
    }
    best.map(|(cell, _)| cell)
}

/// Like [`route`], but a missing owner is a routing error.
pub fn resolve<'a>(scope: &str, cells: &'a [Cell]) -> Result<&'a Cell, RigError> {
    route(scope, cells).ok_or_else(|| RigError::NoCellForScope {
        scope: scope.to_string(),
    })
}
