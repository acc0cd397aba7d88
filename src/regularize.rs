//! Regularization penalties, proximal operators, and feasible-set
//! projections for the factor matrices.
//!
//! Infeasibility is not an error: a point outside a regularizer's feasible
//! set costs `f64::INFINITY`, which the training driver's line search
//! interprets as "reject this point". Matrix-level sums short-circuit as
//! soon as one row is infeasible.
//!
//! The sparsity-constrained proximal operators (OneSparse, UnitOneSparse)
//! need an arg-max; ties are broken uniformly at random through an injected
//! RNG so tests can pin the outcome with a fixed seed.

use crate::model::Regularizer;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::Rng;

/// Positive value substituted for a non-positive OneSparse winner so the
/// result stays strictly inside the feasible set.
const ONE_SPARSE_EPSILON: f64 = 1e-6;

/// r(u): penalty of a single row of X or column of Y. Returns 0 for
/// feasible points of the hard-constraint variants, a finite cost for the
/// smooth variants, and `f64::INFINITY` for infeasible points.
pub fn regularize(u: ArrayView1<'_, f64>, regularizer: Regularizer) -> f64 {
    match regularizer {
        Regularizer::None => 0.0,
        Regularizer::Quadratic => u.iter().map(|&x| x * x).sum(),
        Regularizer::L2 => u.iter().map(|&x| x * x).sum::<f64>().sqrt(),
        Regularizer::L1 => u.iter().map(|&x| x.abs()).sum(),
        Regularizer::NonNegative => {
            if u.iter().any(|&x| x < 0.0) { f64::INFINITY } else { 0.0 }
        }
        Regularizer::OneSparse => {
            let mut positive = 0usize;
            for &x in u.iter() {
                if x < 0.0 {
                    return f64::INFINITY;
                }
                if x > 0.0 {
                    positive += 1;
                }
            }
            if positive == 1 { 0.0 } else { f64::INFINITY }
        }
        Regularizer::UnitOneSparse => {
            let mut ones = 0usize;
            for &x in u.iter() {
                if x == 1.0 {
                    ones += 1;
                } else if x != 0.0 {
                    return f64::INFINITY;
                }
            }
            if ones == 1 { 0.0 } else { f64::INFINITY }
        }
        Regularizer::Simplex => {
            let mut sum = 0.0;
            for &x in u.iter() {
                if x < 0.0 {
                    return f64::INFINITY;
                }
                sum += x;
            }
            if equals_within_ulp(sum, 1.0) { 0.0 } else { f64::INFINITY }
        }
    }
}

/// Σ_i r(u_i): total penalty of a matrix, one feasibility group per row.
/// Short-circuits to `f64::INFINITY` on the first infeasible row.
pub fn regularize_rows(u: ArrayView2<'_, f64>, regularizer: Regularizer) -> f64 {
    if regularizer == Regularizer::None {
        return 0.0;
    }
    let mut total = 0.0;
    for row in u.axis_iter(Axis(0)) {
        total += regularize(row, regularizer);
        if total.is_infinite() {
            return total;
        }
    }
    total
}

/// prox_{αγr}(u): the minimizer of `γ·r(v) + (1/2α)‖v − u‖²`.
///
/// A zero step size or zero weight leaves `u` untouched. For the
/// hard-constraint variants this is the Euclidean projection onto the
/// feasible set regardless of `alpha` and `gamma`.
pub fn prox<R: Rng + ?Sized>(
    u: ArrayView1<'_, f64>,
    alpha: f64,
    gamma: f64,
    regularizer: Regularizer,
    rng: &mut R,
) -> Array1<f64> {
    if alpha == 0.0 || gamma == 0.0 {
        return u.to_owned();
    }
    match regularizer {
        Regularizer::None => u.to_owned(),
        Regularizer::Quadratic => u.mapv(|x| x / (1.0 + 2.0 * alpha * gamma)),
        Regularizer::L2 => {
            // Moreau decomposition; Parikh & Boyd, Proximal Algorithms §6.5.1.
            let norm = u.iter().map(|&x| x * x).sum::<f64>().sqrt();
            let weight = 1.0 - alpha * gamma / norm;
            if weight < 0.0 { Array1::zeros(u.len()) } else { u.mapv(|x| weight * x) }
        }
        Regularizer::L1 => {
            u.mapv(|x| f64::max(x - alpha * gamma, 0.0) + f64::min(x + alpha * gamma, 0.0))
        }
        Regularizer::NonNegative => u.mapv(|x| f64::max(x, 0.0)),
        Regularizer::OneSparse => {
            let idx = max_index(u, rng);
            let mut v = Array1::zeros(u.len());
            v[idx] = if u[idx] > 0.0 { u[idx] } else { ONE_SPARSE_EPSILON };
            v
        }
        Regularizer::UnitOneSparse => {
            let idx = max_index(u, rng);
            let mut v = Array1::zeros(u.len());
            v[idx] = 1.0;
            v
        }
        Regularizer::Simplex => project_simplex(u),
    }
}

/// Projects `u` into the regularizer's feasible set; used at
/// initialization so the starting factors carry a finite penalty.
///
/// The smooth variants have full domain, so `u` passes through. Simplex
/// checks feasibility first to skip the O(n log n) projection when the
/// input already lies on the simplex.
pub fn project<R: Rng + ?Sized>(
    u: ArrayView1<'_, f64>,
    regularizer: Regularizer,
    rng: &mut R,
) -> Array1<f64> {
    match regularizer {
        Regularizer::None | Regularizer::Quadratic | Regularizer::L2 | Regularizer::L1 => {
            u.to_owned()
        }
        // The prox of an indicator function is Euclidean projection.
        Regularizer::NonNegative | Regularizer::OneSparse | Regularizer::UnitOneSparse => {
            prox(u, 1.0, 1.0, regularizer, rng)
        }
        Regularizer::Simplex => {
            if regularize(u, Regularizer::Simplex) == 0.0 {
                u.to_owned()
            } else {
                prox(u, 1.0, 1.0, Regularizer::Simplex, rng)
            }
        }
    }
}

/// Euclidean projection onto the probability simplex, by the sort-and-scan
/// algorithm of Chen & Ye (arXiv:1101.6081).
fn project_simplex(u: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = u.len();

    // 1) Index sort of u in ascending order.
    let mut idxs: Vec<usize> = (0..n).collect();
    idxs.sort_by(|&i, &j| u[i].partial_cmp(&u[j]).unwrap_or(std::cmp::Ordering::Equal));

    // 2) Suffix sums of the sorted values: csum[i] = Σ_{j>=i} sorted(u)[j].
    let mut csum = vec![0.0; n];
    csum[n - 1] = u[idxs[n - 1]];
    for i in (0..n - 1).rev() {
        csum[i] = csum[i + 1] + u[idxs[i]];
    }

    // 3) The optimal shift is the first t_i = (Σ_{j>i} u[j] − 1)/(n − i)
    //    (scanning i = n-1 down to 1) that is >= the next-smaller sorted
    //    value; fall back to shifting every coordinate.
    let mut t = (csum[0] - 1.0) / n as f64;
    for i in (1..n).rev() {
        let tmp = (csum[i] - 1.0) / (n - i) as f64;
        if tmp >= u[idxs[i - 1]] {
            t = tmp;
            break;
        }
    }

    // 4) Shift and clamp.
    u.mapv(|x| f64::max(x - t, 0.0))
}

/// Index of the largest entry, ties broken uniformly at random.
fn max_index<R: Rng + ?Sized>(u: ArrayView1<'_, f64>, rng: &mut R) -> usize {
    let mut idx = 0;
    let mut ties = 1u32;
    for i in 1..u.len() {
        if u[i] > u[idx] {
            idx = i;
            ties = 1;
        } else if u[i] == u[idx] {
            // Reservoir choice keeps each tied index equally likely.
            ties += 1;
            if rng.gen_range(0..ties) == 0 {
                idx = i;
            }
        }
    }
    idx
}

/// True when `a` and `b` differ by at most one unit in the last place of
/// the larger magnitude. Used for the simplex sum-to-one check so that
/// accumulated rounding from a legitimate simplex point is not flagged
/// infeasible.
fn equals_within_ulp(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() <= f64::EPSILON * f64::max(a.abs(), b.abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn indicator_penalties_are_zero_or_infinite() {
        assert_eq!(regularize(array![1.0, 0.0, 2.5].view(), Regularizer::NonNegative), 0.0);
        assert_eq!(
            regularize(array![1.0, -0.1].view(), Regularizer::NonNegative),
            f64::INFINITY
        );

        assert_eq!(regularize(array![0.0, 3.0, 0.0].view(), Regularizer::OneSparse), 0.0);
        assert_eq!(
            regularize(array![1.0, 3.0, 0.0].view(), Regularizer::OneSparse),
            f64::INFINITY
        );
        assert_eq!(
            regularize(array![0.0, -3.0, 0.0].view(), Regularizer::OneSparse),
            f64::INFINITY
        );

        assert_eq!(regularize(array![0.0, 1.0, 0.0].view(), Regularizer::UnitOneSparse), 0.0);
        assert_eq!(
            regularize(array![0.5, 0.5, 0.0].view(), Regularizer::UnitOneSparse),
            f64::INFINITY
        );
        assert_eq!(
            regularize(array![1.0, 1.0, 0.0].view(), Regularizer::UnitOneSparse),
            f64::INFINITY
        );

        assert_eq!(regularize(array![0.2, 0.3, 0.5].view(), Regularizer::Simplex), 0.0);
        assert_eq!(
            regularize(array![0.2, 0.3, 0.6].view(), Regularizer::Simplex),
            f64::INFINITY
        );
        assert_eq!(
            regularize(array![-0.2, 0.7, 0.5].view(), Regularizer::Simplex),
            f64::INFINITY
        );
        // One third three times sums to 1 only up to rounding; the ulp
        // tolerance must accept it.
        let third = 1.0 / 3.0;
        assert_eq!(regularize(array![third, third, third].view(), Regularizer::Simplex), 0.0);
    }

    #[test]
    fn smooth_penalties() {
        let u = array![3.0, -4.0];
        assert_abs_diff_eq!(regularize(u.view(), Regularizer::Quadratic), 25.0);
        assert_abs_diff_eq!(regularize(u.view(), Regularizer::L2), 5.0);
        assert_abs_diff_eq!(regularize(u.view(), Regularizer::L1), 7.0);
        assert_abs_diff_eq!(regularize(u.view(), Regularizer::None), 0.0);
    }

    #[test]
    fn matrix_sum_short_circuits_on_infeasible_row() {
        let m = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, -1.0, 0.0, 1.0, 1.0]).unwrap();
        assert_eq!(regularize_rows(m.view(), Regularizer::NonNegative), f64::INFINITY);
        assert_abs_diff_eq!(regularize_rows(m.view(), Regularizer::L1), 6.0);
        assert_eq!(regularize_rows(m.view(), Regularizer::None), 0.0);
    }

    #[test]
    fn quadratic_prox_shrinks() {
        let u = array![2.0, -4.0];
        let v = prox(u.view(), 0.5, 1.0, Regularizer::Quadratic, &mut rng());
        assert_abs_diff_eq!(v[0], 1.0);
        assert_abs_diff_eq!(v[1], -2.0);
    }

    #[test]
    fn l2_prox_uses_moreau_shrinkage() {
        let u = array![3.0, 4.0];
        // norm 5, shrink factor 1 - 1/5.
        let v = prox(u.view(), 1.0, 1.0, Regularizer::L2, &mut rng());
        assert_abs_diff_eq!(v[0], 2.4, epsilon = 1e-12);
        assert_abs_diff_eq!(v[1], 3.2, epsilon = 1e-12);
        // Inside the threshold the prox collapses to zero.
        let w = prox(u.view(), 10.0, 1.0, Regularizer::L2, &mut rng());
        assert_eq!(w, array![0.0, 0.0]);
    }

    #[test]
    fn l1_prox_soft_thresholds() {
        let u = array![1.5, -0.2, 0.0, -3.0];
        let once = prox(u.view(), 1.0, 0.5, Regularizer::L1, &mut rng());
        assert_abs_diff_eq!(once[0], 1.0);
        assert_abs_diff_eq!(once[1], 0.0);
        assert_abs_diff_eq!(once[2], 0.0);
        assert_abs_diff_eq!(once[3], -2.5);
    }

    #[test]
    fn l1_prox_is_idempotent_at_its_fixed_points() {
        // Entries within the threshold map to zero, and zero is a fixed
        // point, so a second application with the same step and weight
        // changes nothing.
        let u = array![0.3, -0.2, 0.0];
        let once = prox(u.view(), 1.0, 0.5, Regularizer::L1, &mut rng());
        assert_eq!(once, array![0.0, 0.0, 0.0]);
        let twice = prox(once.view(), 1.0, 0.5, Regularizer::L1, &mut rng());
        assert_eq!(twice, once);
    }

    #[test]
    fn zero_step_or_weight_is_identity() {
        let u = array![1.0, -2.0, 3.0];
        assert_eq!(prox(u.view(), 0.0, 1.0, Regularizer::L1, &mut rng()), u);
        assert_eq!(prox(u.view(), 1.0, 0.0, Regularizer::Simplex, &mut rng()), u);
    }

    #[test]
    fn one_sparse_prox_keeps_argmax() {
        let u = array![0.3, 2.0, -1.0];
        let v = prox(u.view(), 1.0, 1.0, Regularizer::OneSparse, &mut rng());
        assert_eq!(v, array![0.0, 2.0, 0.0]);

        // A non-positive winner is replaced with the small positive epsilon
        // so the output is feasible.
        let w = prox(array![-5.0, -2.0].view(), 1.0, 1.0, Regularizer::OneSparse, &mut rng());
        assert_eq!(w[0], 0.0);
        assert_eq!(w[1], ONE_SPARSE_EPSILON);
        assert_eq!(regularize(w.view(), Regularizer::OneSparse), 0.0);
    }

    #[test]
    fn unit_one_sparse_prox_is_one_hot() {
        let u = array![0.3, 0.9, 0.1];
        let v = prox(u.view(), 1.0, 1.0, Regularizer::UnitOneSparse, &mut rng());
        assert_eq!(v, array![0.0, 1.0, 0.0]);
        assert_eq!(regularize(v.view(), Regularizer::UnitOneSparse), 0.0);
    }

    #[test]
    fn tie_break_is_deterministic_under_a_fixed_seed() {
        let u = array![1.0, 1.0, 1.0];
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let va = prox(u.view(), 1.0, 1.0, Regularizer::UnitOneSparse, &mut a);
        let vb = prox(u.view(), 1.0, 1.0, Regularizer::UnitOneSparse, &mut b);
        assert_eq!(va, vb);
        assert_eq!(regularize(va.view(), Regularizer::UnitOneSparse), 0.0);
    }

    #[test]
    fn simplex_projection_of_uniform_vector() {
        let v = prox(array![2.0, 2.0, 2.0].view(), 1.0, 1.0, Regularizer::Simplex, &mut rng());
        for &x in v.iter() {
            assert_abs_diff_eq!(x, 1.0 / 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn simplex_projection_clamps_small_coordinates() {
        let v = prox(array![1.0, 0.0, -1.0].view(), 1.0, 1.0, Regularizer::Simplex, &mut rng());
        assert_abs_diff_eq!(v[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v[2], 0.0, epsilon = 1e-12);
        assert_eq!(regularize(v.view(), Regularizer::Simplex), 0.0);
    }

    #[test]
    fn projection_short_circuits_feasible_simplex_points() {
        let u = array![0.25, 0.5, 0.25];
        let v = project(u.view(), Regularizer::Simplex, &mut rng());
        // Bitwise unchanged: the projection was skipped entirely.
        assert_eq!(v, u);

        let w = project(array![0.5, 0.5, 0.5].view(), Regularizer::Simplex, &mut rng());
        assert_eq!(regularize(w.view(), Regularizer::Simplex), 0.0);
    }

    #[test]
    fn projection_passes_smooth_domains_through() {
        let u = array![-3.0, 9.0];
        assert_eq!(project(u.view(), Regularizer::L1, &mut rng()), u);
        assert_eq!(project(u.view(), Regularizer::None, &mut rng()), u);
        let nn = project(u.view(), Regularizer::NonNegative, &mut rng());
        assert_eq!(nn, array![0.0, 9.0]);
    }
}
