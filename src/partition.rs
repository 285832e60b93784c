//! Order-preserving split of an input batch across workers.

/// Split `items` into exactly `k` contiguous slices.
///
/// Slice sizes differ by at most one and the larger slices come first.
/// Concatenating the slices in order yields `items` again. When `k`
/// exceeds the number of items the trailing slices are empty. `k == 0`
/// is treated as one slice.
pub fn partition<T: Clone>(items: &[T], k: usize) -> Vec<Vec<T>> {
    let k = k.max(1);
    let base = items.len() / k;
    let remainder = items.len() % k;

    let mut slices = Vec::with_capacity(k);
    let mut start = 0;
    for i in 0..k {
        let len = base + usize::from(i < remainder);
        slices.push(items[start..start + len].to_vec());
        start += len;
    }
    slices
}
