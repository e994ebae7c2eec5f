//! Predicate-driven search over an ordered slice.
//!
//! Both functions assume the slice is ordered so that the predicate is
//! monotonic over it: every item failing the predicate precedes every item
//! satisfying it. If that assumption is violated they still terminate and
//! still return an item satisfying the predicate whose predecessor does
//! not, but nothing stronger. If the last item fails the predicate, a
//! satisfying item might not be found at all.

/// Returns the first item in `items` for which `predicate` succeeds, or
/// `None` if there is no such item.
///
/// Optimized for the case where the searched-for item is near the head:
/// the first item is probed before any binary stepping.
pub fn bisect<T, P>(mut predicate: P, items: &[T]) -> Option<&T>
where
    P: FnMut(&T) -> bool,
{
    if items.is_empty() {
        return None;
    }

    let mut lo = 0;
    let mut hi = items.len() - 1;

    // Check the first item immediately.
    if predicate(&items[lo]) {
        return Some(&items[lo]);
    }

    // Invariants:
    //  !predicate(items[lo])
    //  predicate(items[hi])
    while lo + 1 != hi {
        let mid = (lo + hi) / 2;
        if predicate(&items[mid]) {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    Some(&items[hi])
}

/// Reduces the search space for [`bisect`], assuming the searched-for item
/// is near the head of `items`.
///
/// Probes at exponentially growing distances until the predicate first
/// succeeds, then returns the contiguous window known to contain the
/// boundary. Returns `None` when the window runs off the end of the slice
/// without the predicate ever succeeding.
pub fn gallop<T, P>(mut predicate: P, items: &[T]) -> Option<&[T]>
where
    P: FnMut(&T) -> bool,
{
    if items.is_empty() {
        return None;
    }

    if predicate(&items[0]) {
        return Some(&items[0..1]);
    }

    // Invariant: !predicate(items[lo])
    let mut lo = 0;
    let mut hi = 1;
    while hi < items.len() {
        if predicate(&items[hi]) {
            break;
        }
        let step = (hi - lo) * 2;
        lo = hi;
        hi += step;
    }

    // Galloped past the end; clamp and re-check the final item.
    if hi >= items.len() {
        hi = items.len() - 1;
        if hi == lo || !predicate(&items[hi]) {
            return None;
        }
    }

    Some(&items[lo..=hi])
}
