//! Enumeration of target-x independent polynomial terms.
//!
//! A fresh independent matrix of order `N` holds every exponent tuple
//! `(i, j, k, l, 0)` with `i + j + k + l ≤ N`, grouped by increasing order.
//! Within one order the tuples follow a fixed nested-loop precedence
//! (outer to inner: `l` on `yp_fp`, `k` on `y_fp`, `j` on `xp_fp`, with `i` on
//! `x_fp` taking the remainder), which existing matrix files depend on:
//!
//! ```text
//! order 0: (0 0 0 0 0)
//! order 1: (1 0 0 0 0) (0 1 0 0 0) (0 0 1 0 0) (0 0 0 1 0)
//! order 2: (2 0 0 0 0) (1 1 0 0 0) (0 2 0 0 0) (1 0 1 0 0) (0 1 1 0 0) ...
//! ```

use super::PolynomialTerm;

/// Number of independent terms up to and including `max_order`.
///
/// Equal to the number of non-negative 4-tuples with sum ≤ N, i.e. C(N+4, 4).
pub fn num_terms(max_order: u32) -> usize {
    let n = max_order as usize;
    (n + 1) * (n + 2) * (n + 3) * (n + 4) / 24
}

/// Independent terms of exactly `order`, in file order.
pub fn terms_of_order(order: u32) -> Vec<PolynomialTerm> {
    let mut terms = Vec::new();
    for l in 0..=order {
        for k in 0..=(order - l) {
            for j in 0..=(order - l - k) {
                let i = order - l - k - j;
                terms.push(PolynomialTerm::new(i, j, k, l, 0));
            }
        }
    }
    terms
}

/// All independent terms up to `max_order`, in file order.
pub fn fresh_independent_terms(max_order: u32) -> Vec<PolynomialTerm> {
    let mut terms = Vec::with_capacity(num_terms(max_order));
    for order in 0..=max_order {
        terms.extend(terms_of_order(order));
    }
    terms
}
