//! Adaptive Simpson quadrature, enough to integrate the low degree
//! polynomials used by the linear multistep coefficients.

/// Maximum number of interval bisections.
const MAX_DEPTH: u32 = 50;

#[derive(Debug, Clone, Copy)]
pub(crate) struct IntegrationOutput {
    pub integral: f64,
    pub error_estimate: f64,
}

/// Integrates `f` from `a` to `b` up to the absolute tolerance `tol`. The
/// bounds may be given in decreasing order, the sign of the result follows.
pub(crate) fn integrate<F: Fn(f64) -> f64>(f: F, a: f64, b: f64, tol: f64) -> IntegrationOutput {
    if a == b {
        return IntegrationOutput { integral: 0., error_estimate: 0. };
    }
    let (fa, fb) = (f(a), f(b));
    let m = 0.5 * (a + b);
    let fm = f(m);
    let whole = simpson(a, b, fa, fm, fb);
    let mut error_estimate = 0.;
    let integral = adaptive(&f, a, b, fa, fm, fb, whole, tol, MAX_DEPTH, &mut error_estimate);
    IntegrationOutput { integral, error_estimate }
}

fn simpson(a: f64, b: f64, fa: f64, fm: f64, fb: f64) -> f64 {
    (b - a) / 6. * (fa + 4. * fm + fb)
}

#[allow(clippy::too_many_arguments)]
fn adaptive<F: Fn(f64) -> f64>(
    f: &F,
    a: f64,
    b: f64,
    fa: f64,
    fm: f64,
    fb: f64,
    whole: f64,
    tol: f64,
    depth: u32,
    error_estimate: &mut f64,
) -> f64 {
    let m = 0.5 * (a + b);
    let (lm, rm) = (0.5 * (a + m), 0.5 * (m + b));
    let (flm, frm) = (f(lm), f(rm));
    let left = simpson(a, m, fa, flm, fm);
    let right = simpson(m, b, fm, frm, fb);
    let delta = left + right - whole;
    if depth == 0 || delta.abs() <= 15. * tol {
        *error_estimate += delta.abs() / 15.;
        // Richardson extrapolation.
        return left + right + delta / 15.;
    }
    adaptive(f, a, m, fa, flm, fm, left, tol / 2., depth - 1, error_estimate)
        + adaptive(f, m, b, fm, frm, fb, right, tol / 2., depth - 1, error_estimate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polynomials_are_exact() {
        let out = integrate(|x| 3. * x * x - 2. * x + 1., 0., 2., 1.49e-8);
        assert!((out.integral - 6.).abs() < 1e-12);
        let out = integrate(|x| x.powi(3), 2., 0., 1.49e-8);
        assert!((out.integral + 4.).abs() < 1e-12);
        assert_eq!(integrate(|x| x, 1., 1., 1e-8).integral, 0.);
    }

    #[test]
    fn smooth_functions_converge() {
        let out = integrate(f64::sin, 0., std::f64::consts::PI, 1.49e-8);
        assert!((out.integral - 2.).abs() < 1e-7, "{out:?}");
        assert!(out.error_estimate < 1e-6);
    }
}
