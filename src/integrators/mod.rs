//! Numerical integration and interpolation on tabulated data.
pub mod riemann;

use num_traits::Float;

/// Trapezoidal rule for samples `ys` at the (not necessarily uniform) abscissas `xs`.
pub fn trapezoid<T: Float>(xs: &[T], ys: &[T]) -> T {
    debug_assert_eq!(xs.len(), ys.len());
    let two = T::one() + T::one();

    xs.windows(2)
        .zip(ys.windows(2))
        .fold(T::zero(), |acc, (x, y)| acc + (x[1] - x[0]) * (y[0] + y[1]) / two)
}

/// Piecewise-linear interpolation of the table (`xp`, `fp`) at `x`.
///
/// `xp` must be increasing. Outside of the table the first or last value is returned.
pub fn interp<T: Float>(x: T, xp: &[T], fp: &[T]) -> T {
    debug_assert_eq!(xp.len(), fp.len());

    match xp.len() {
        0 => return T::nan(),
        1 => return fp[0],
        _ => {}
    }

    if x <= xp[0] {
        return fp[0];
    }

    let last = xp.len() - 1;
    if x >= xp[last] {
        return fp[last];
    }

    // index of the first abscissa strictly larger than `x`
    let upper = xp.partition_point(|v| *v <= x);
    let lower = upper - 1;
    let t = (x - xp[lower]) / (xp[upper] - xp[lower]);

    fp[lower] + t * (fp[upper] - fp[lower])
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_trapezoid_is_exact_for_lines() {
        let xs = [0.0, 0.5, 2.0, 3.0];
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        // int_0^3 (2x + 1) dx = 9 + 3
        assert_approx_eq!(trapezoid(&xs, &ys), 12.0, 1e-14);
    }

    #[test]
    fn test_interp() {
        let xp = [1.0, 2.0, 4.0];
        let fp = [10.0, 20.0, 0.0];

        assert_eq!(interp(0.0, &xp, &fp), 10.0);
        assert_eq!(interp(1.5, &xp, &fp), 15.0);
        assert_eq!(interp(2.0, &xp, &fp), 20.0);
        assert_eq!(interp(3.0, &xp, &fp), 10.0);
        assert_eq!(interp(5.0, &xp, &fp), 0.0);
    }
}
