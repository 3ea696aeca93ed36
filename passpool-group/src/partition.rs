use passpool_core::model::MAX_GROUP_SIZE;

/// Sizes of the groups `n` riders are split into, largest first.
///
/// `k = ceil(n / 5)` groups of `floor(n / k)`, the first `n mod k` of them one larger.
pub fn group_sizes(n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }

    let k = n.div_ceil(MAX_GROUP_SIZE);
    let base = n / k;
    let extra = n % k;

    (0..k).map(|i| if i < extra { base + 1 } else { base }).collect()
}

/// Split an ordered list of riders into groups, preserving input order.
///
/// Deterministic for a given order: 6 riders become 3+3, never 5+1.
pub fn partition<T: Clone>(riders: &[T]) -> Vec<Vec<T>> {
    let mut groups = Vec::new();
    let mut offset = 0;

    for size in group_sizes(riders.len()) {
        debug_assert!((1..=MAX_GROUP_SIZE).contains(&size));
        groups.push(riders[offset..offset + size].to_vec());
        offset += size;
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_inputs() {
        assert!(partition::<u32>(&[]).is_empty());
        assert_eq!(partition(&[7]), vec![vec![7]]);
        assert_eq!(partition(&[1, 2, 3, 4, 5]), vec![vec![1, 2, 3, 4, 5]]);
    }

    #[test]
    fn test_six_riders_split_evenly() {
        assert_eq!(
            partition(&[1, 2, 3, 4, 5, 6]),
            vec![vec![1, 2, 3], vec![4, 5, 6]]
        );
    }

    #[test]
    fn test_remainder_goes_to_first_groups() {
        // 11 riders: k = 3, base 3, two groups get an extra rider
        assert_eq!(group_sizes(11), vec![4, 4, 3]);
        let groups = partition(&(1..=11).collect::<Vec<_>>());
        assert_eq!(groups[0], vec![1, 2, 3, 4]);
        assert_eq!(groups[1], vec![5, 6, 7, 8]);
        assert_eq!(groups[2], vec![9, 10, 11]);
    }

    #[test]
    fn test_size_invariants_hold() {
        for n in 0..=200usize {
            let riders: Vec<usize> = (0..n).collect();
            let groups = partition(&riders);

            assert_eq!(groups.is_empty(), n == 0);
            assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), n);
            assert!(groups.iter().all(|g| (1..=MAX_GROUP_SIZE).contains(&g.len())));

            if n >= 6 {
                let max = groups.iter().map(Vec::len).max().unwrap();
                let min = groups.iter().map(Vec::len).min().unwrap();
                assert!(max - min <= 1, "n={} sizes differ by {}", n, max - min);
            }

            // order preserved
            let flat: Vec<usize> = groups.into_iter().flatten().collect();
            assert_eq!(flat, riders);
        }
    }
}
