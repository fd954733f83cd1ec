//! Queue gate: vetoes scheduling below a disabled container.

use crate::container::ComputedContainer;

/// Walks the ancestor chain of `owner` (the container itself
/// included); any disabled hop blocks scheduling.
pub fn should_schedule(owner: &ComputedContainer) -> bool {
    if owner.is_disabled() {
        return false;
    }
    let mut ancestor = owner.parent();
    while let Some(container) = ancestor {
        if container.is_disabled() {
            return false;
        }
        ancestor = container.parent();
    }
    true
}
