use crate::common::DimSize;

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Rounds `value` up to the next multiple of `multiple`.
///
/// ```
/// # use space_to_batch::utils::round_up_to_multiple;
/// assert_eq!(round_up_to_multiple(7, 4), 8);
/// assert_eq!(round_up_to_multiple(8, 4), 8);
/// ```
pub fn round_up_to_multiple(value: DimSize, multiple: DimSize) -> DimSize {
    divrem::DivCeil::div_ceil(value, multiple) * multiple
}

/// The inverse of a permutation: `inverse[perm[i]] == i`.
///
/// ```
/// # use space_to_batch::utils::inverse_permutation;
/// assert_eq!(inverse_permutation(&[1, 2, 0]), vec![2, 0, 1]);
/// ```
pub fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}

/// Whether `perm` is a permutation of `0..perm.len()`.
pub fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}
