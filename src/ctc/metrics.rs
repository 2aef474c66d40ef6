//! Edit-distance quality metrics

/// Levenshtein distance between two sequences
pub fn levenshtein<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, x) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(x != y);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// Edit distance divided by the length of the truth.
///
/// Zero when both sequences are empty, infinite when only the truth is.
pub fn normalized_edit_distance<T: PartialEq>(hypothesis: &[T], truth: &[T]) -> f64 {
    let distance = levenshtein(hypothesis, truth);
    if truth.is_empty() {
        return if distance == 0 { 0.0 } else { f64::INFINITY };
    }
    distance as f64 / truth.len() as f64
}

/// Mean normalized edit distance over a batch; zero for an empty batch.
pub fn mean_edit_distance<T: PartialEq>(hypotheses: &[Vec<T>], truths: &[Vec<T>]) -> f64 {
    let count = hypotheses.len().min(truths.len());
    if count == 0 {
        return 0.0;
    }
    let total: f64 = hypotheses
        .iter()
        .zip(truths)
        .map(|(hyp, truth)| normalized_edit_distance(hyp, truth))
        .sum();
    total / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_distances() {
        assert_eq!(levenshtein(b"kitten", b"sitting"), 3);
        assert_eq!(levenshtein::<u32>(&[], &[1, 2]), 2);
        assert_eq!(levenshtein(&[1, 2, 3], &[1, 2, 3]), 0);
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalized_edit_distance(&[1u32, 2], &[1, 3, 4, 5]), 0.75);
        assert_eq!(normalized_edit_distance::<u32>(&[], &[]), 0.0);
        assert!(normalized_edit_distance(&[1u32], &[]).is_infinite());
    }

    #[test]
    fn test_batch_mean() {
        let hyps = vec![vec![1u32, 2], vec![3]];
        let truths = vec![vec![1u32, 2], vec![4, 5]];
        assert_eq!(mean_edit_distance(&hyps, &truths), 0.5);
        assert_eq!(mean_edit_distance::<u32>(&[], &[]), 0.0);
    }

    proptest! {
        #[test]
        fn prop_distance_is_symmetric(a in prop::collection::vec(0u32..5, 0..12),
                                      b in prop::collection::vec(0u32..5, 0..12)) {
            prop_assert_eq!(levenshtein(&a, &b), levenshtein(&b, &a));
        }

        #[test]
        fn prop_zero_iff_equal(a in prop::collection::vec(0u32..3, 0..10),
                               b in prop::collection::vec(0u32..3, 0..10)) {
            prop_assert_eq!(levenshtein(&a, &b) == 0, a == b);
        }

        #[test]
        fn prop_bounded_by_longer_length(a in prop::collection::vec(0u32..5, 0..12),
                                         b in prop::collection::vec(0u32..5, 0..12)) {
            let d = levenshtein(&a, &b);
            prop_assert!(d >= a.len().abs_diff(b.len()));
            prop_assert!(d <= a.len().max(b.len()));
        }
    }
}
