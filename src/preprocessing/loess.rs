//! Local quadratic regression with tricube weights, used for the mean-variance trend.
//!
//! The fit is evaluated exactly at every point for small inputs. Larger inputs are fitted
//! on an evenly spaced grid of anchors and linearly interpolated between them.

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

const MAX_ANCHORS: usize = 200;

fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        let t = 1.0 - u * u * u;
        t * t * t
    }
}

/// Indices `[lo, hi)` of the `q` sorted points nearest to `x0`.
fn nearest_window(xs: &[f64], x0: f64, q: usize) -> (usize, usize) {
    let n = xs.len();
    let p = xs.partition_point(|&x| x < x0);
    let (mut lo, mut hi) = (p, p);
    while hi - lo < q {
        let take_left = if hi == n {
            true
        } else if lo == 0 {
            false
        } else {
            x0 - xs[lo - 1] <= xs[hi] - x0
        };
        if take_left {
            lo -= 1;
        } else {
            hi += 1;
        }
    }
    (lo, hi)
}

fn local_fit(xs: &[f64], ys: &[f64], x0: f64, q: usize) -> f64 {
    let (lo, hi) = nearest_window(xs, x0, q);
    let dmax = (x0 - xs[lo]).max(xs[hi - 1] - x0);
    let window = lo..hi;

    if dmax <= 0.0 {
        return ys[window.clone()].iter().sum::<f64>() / (hi - lo) as f64;
    }

    // moments in the scaled coordinate u = (x - x0) / dmax
    let mut s = [0.0f64; 5];
    let mut t = [0.0f64; 3];
    for i in window.clone() {
        let u = (xs[i] - x0) / dmax;
        let w = tricube(u.abs());
        if w == 0.0 {
            continue;
        }
        let mut uk = w;
        for (k, sk) in s.iter_mut().enumerate() {
            *sk += uk;
            if k < 3 {
                t[k] += uk * ys[i];
            }
            uk *= u;
        }
    }

    if s[0] <= 0.0 {
        return ys[window].iter().sum::<f64>() / (hi - lo) as f64;
    }

    let quad = Matrix3::new(s[0], s[1], s[2], s[1], s[2], s[3], s[2], s[3], s[4]);
    if quad.determinant().abs() > 1e-10 * s[0].powi(3) {
        if let Some(beta) = quad.lu().solve(&Vector3::new(t[0], t[1], t[2])) {
            return beta[0];
        }
    }

    let lin = Matrix2::new(s[0], s[1], s[1], s[2]);
    if lin.determinant().abs() > 1e-10 * s[0].powi(2) {
        if let Some(beta) = lin.lu().solve(&Vector2::new(t[0], t[1])) {
            return beta[0];
        }
    }

    t[0] / s[0]
}

/// Fitted values of `y ~ x` at every input point, in input order.
pub(crate) fn loess_fit(x: &[f64], y: &[f64], span: f64) -> Vec<f64> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    if n < 3 {
        let mean = y.iter().sum::<f64>() / n as f64;
        return vec![mean; n];
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]).then(a.cmp(&b)));
    let xs: Vec<f64> = order.iter().map(|&i| x[i]).collect();
    let ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();

    let q = ((span * n as f64).ceil() as usize).max(3).min(n);

    let sorted_fit: Vec<f64> = if n <= MAX_ANCHORS {
        xs.iter().map(|&x0| local_fit(&xs, &ys, x0, q)).collect()
    } else {
        let (first, last) = (xs[0], xs[n - 1]);
        let step = (last - first) / (MAX_ANCHORS - 1) as f64;
        let anchors: Vec<f64> = (0..MAX_ANCHORS).map(|a| first + step * a as f64).collect();
        let fitted: Vec<f64> = anchors.iter().map(|&a| local_fit(&xs, &ys, a, q)).collect();
        xs.iter()
            .map(|&x0| {
                if step <= 0.0 {
                    return fitted[0];
                }
                let pos = ((x0 - first) / step).clamp(0.0, (MAX_ANCHORS - 1) as f64);
                let a = (pos.floor() as usize).min(MAX_ANCHORS - 2);
                let frac = pos - a as f64;
                fitted[a] * (1.0 - frac) + fitted[a + 1] * frac
            })
            .collect()
    };

    let mut fit = vec![0.0; n];
    for (k, &i) in order.iter().enumerate() {
        fit[i] = sorted_fit[k];
    }
    fit
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reproduces_a_quadratic() {
        let x: Vec<f64> = (0..50).map(|i| i as f64 / 10.0).collect();
        let y: Vec<f64> = x.iter().map(|v| 1.0 + 2.0 * v - 0.5 * v * v).collect();
        let fit = loess_fit(&x, &y, 0.3);
        for (f, t) in fit.iter().zip(&y) {
            assert_abs_diff_eq!(*f, *t, epsilon = 1e-8);
        }
    }

    #[test]
    fn interpolated_fit_tracks_a_line() {
        let x: Vec<f64> = (0..1000).map(|i| ((i * 7919) % 1000) as f64 / 100.0).collect();
        let y: Vec<f64> = x.iter().map(|v| 3.0 * v - 1.0).collect();
        let fit = loess_fit(&x, &y, 0.3);
        for (f, t) in fit.iter().zip(&y) {
            assert_abs_diff_eq!(*f, *t, epsilon = 1e-6);
        }
    }

    #[test]
    fn degenerate_inputs() {
        assert!(loess_fit(&[], &[], 0.3).is_empty());
        assert_eq!(loess_fit(&[1.0, 2.0], &[2.0, 4.0], 0.3), vec![3.0, 3.0]);
        let flat = loess_fit(&[1.0; 5], &[1.0, 2.0, 3.0, 4.0, 5.0], 0.5);
        assert!(flat.iter().all(|v| v.is_finite()));
    }
}
