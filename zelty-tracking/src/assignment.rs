//! Minimum-cost assignment (Kuhn-Munkres with potentials and shortest
//! augmenting paths, O(n²·m)).

/// Solve the assignment problem on an `n × m` cost matrix.
///
/// Returns `(row, column)` pairs for the minimum-total-cost matching of
/// size `min(n, m)`, sorted by row. Rows are given as slices of equal
/// length; an empty matrix yields an empty matching.
pub fn hungarian(cost: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let n = cost.len();
    if n == 0 {
        return Vec::new();
    }
    let m = cost[0].len();
    if m == 0 {
        return Vec::new();
    }
    debug_assert!(cost.iter().all(|row| row.len() == m));

    if n > m {
        // The algorithm below requires rows <= columns; solve the
        // transpose and swap the pairs back.
        let transposed: Vec<Vec<f64>> = (0..m)
            .map(|j| (0..n).map(|i| cost[i][j]).collect())
            .collect();
        let mut flipped: Vec<(usize, usize)> = hungarian(&transposed)
            .into_iter()
            .map(|(r, c)| (c, r))
            .collect();
        flipped.sort_unstable();
        return flipped;
    }

    // 1-indexed potentials; p[j] is the row matched to column j (0 = none).
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if !used[j] {
                    let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                    if cur < minv[j] {
                        minv[j] = cur;
                        way[j] = j0;
                    }
                    if minv[j] < delta {
                        delta = minv[j];
                        j1 = j;
                    }
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        // Augment along the found path.
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut result = Vec::with_capacity(n);
    for j in 1..=m {
        if p[j] != 0 {
            result.push((p[j] - 1, j - 1));
        }
    }
    result.sort_unstable();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_matrix_prefers_diagonal() {
        let cost = vec![
            vec![0.0, 1.0, 1.0],
            vec![1.0, 0.0, 1.0],
            vec![1.0, 1.0, 0.0],
        ];
        assert_eq!(hungarian(&cost), vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn classic_square_case() {
        // Optimal total cost is 8 + 3 + 4 = 15 via (0,0), (1,2), (2,1).
        let cost = vec![
            vec![8.0, 4.0, 7.0],
            vec![5.0, 2.0, 3.0],
            vec![9.0, 4.0, 8.0],
        ];
        let matches = hungarian(&cost);
        let total: f64 = matches.iter().map(|&(i, j)| cost[i][j]).sum();
        assert_eq!(matches.len(), 3);
        assert!((total - 15.0).abs() < 1e-9);
    }

    #[test]
    fn rectangular_wide_assigns_every_row() {
        let cost = vec![vec![9.0, 1.0, 5.0], vec![2.0, 8.0, 6.0]];
        let matches = hungarian(&cost);
        assert_eq!(matches, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn rectangular_tall_assigns_every_column() {
        let cost = vec![vec![9.0, 2.0], vec![1.0, 8.0], vec![5.0, 5.0]];
        let matches = hungarian(&cost);
        assert_eq!(matches.len(), 2);
        let total: f64 = matches.iter().map(|&(i, j)| cost[i][j]).sum();
        assert!((total - 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_inputs() {
        assert!(hungarian(&[]).is_empty());
        assert!(hungarian(&[vec![], vec![]]).is_empty());
    }
}
