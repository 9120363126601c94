//! Fixed-step Riemann sums.
//!
//! The line-of-sight projection, the Hankel transform and the matched-filter integrals are all
//! evaluated as plain sums over uniformly spaced points. The step size is part of the result:
//! changing it changes the forecast at the sub-percent level, which is why every rule carries its
//! step explicitly instead of picking one adaptively.
use crate::error::{Error, Result};

use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::Add;

/// One-dimensional integrand.
pub trait Integrand<T>: Send + Sync {
    /// Evaluate the integrand at `x`.
    fn call(&self, x: T) -> T;
}

impl<T, F> Integrand<T> for F
where
    F: Fn(T) -> T + Send + Sync,
{
    fn call(&self, x: T) -> T {
        self(x)
    }
}

/// The points $x_i = x_0 + i\,\Delta x$, $i = 0, \ldots, n-1$, of a fixed-step sum.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct UniformRule<T> {
    start: T,
    step: T,
    samples: usize,
}

impl<T> UniformRule<T>
where
    T: Float + FromPrimitive,
{
    /// Constructor.
    pub fn new(start: T, step: T, samples: usize) -> Self {
        Self {
            start,
            step,
            samples,
        }
    }

    /// Points `start, start + step, ...` strictly below `stop`.
    pub fn from_range(start: T, stop: T, step: T) -> Self {
        let samples = if stop > start && step > T::zero() {
            ((stop - start) / step).ceil().to_usize().unwrap_or(0)
        } else {
            0
        };

        Self::new(start, step, samples)
    }

    /// The step $\Delta x$.
    pub fn step(&self) -> T {
        self.step
    }

    /// Number of points.
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// The `i`-th point.
    pub fn point(&self, i: usize) -> T {
        // samples never exceed what the float type can represent
        self.start + T::from_usize(i).unwrap_or_else(T::nan) * self.step
    }

    /// Iterate over all points.
    pub fn points(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.samples).map(move |i| self.point(i))
    }
}

/// Estimators for a sum performed by [`integrate`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RiemannEstimators<T> {
    sum: T,
    step: T,
    calls: usize,
    non_finite_calls: usize,
    non_zero_calls: usize,
}

impl<T: Float> RiemannEstimators<T> {
    fn new(step: T) -> Self {
        Self {
            sum: T::zero(),
            step,
            calls: 0,
            non_finite_calls: 0,
            non_zero_calls: 0,
        }
    }

    /// Accumulate integrand values that were already evaluated on a grid with spacing `step`.
    pub fn from_values<V>(values: V, step: T) -> Self
    where
        V: IntoIterator<Item = T>,
    {
        values.into_iter().fold(Self::new(step), |mut acc, value| {
            acc.calls += 1;

            if value != T::zero() {
                acc.non_zero_calls += 1;

                if value.is_finite() {
                    acc.sum = acc.sum + value;
                } else {
                    acc.non_finite_calls += 1;
                }
            }

            acc
        })
    }

    /// Returns the value of the integral, $\Delta x \sum_i f(x_i)$.
    pub fn integral(&self) -> T {
        self.sum * self.step
    }

    /// Returns the number of times the integrand has been called.
    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Returns the number of times the integrand returned a non-finite value. These values are
    /// not part of the sum.
    pub fn non_finite_calls(&self) -> usize {
        self.non_finite_calls
    }

    /// Returns the number of times the integrand returned a value different from zero.
    pub fn non_zero_calls(&self) -> usize {
        self.non_zero_calls
    }

    /// The integral, or an error if any integrand value was not finite.
    pub fn checked(&self) -> Result<T>
    where
        T: Debug,
    {
        if self.non_finite_calls > 0 {
            return Err(Error::numerical(format!(
                "{} of {} integrand values were not finite",
                self.non_finite_calls, self.calls
            )));
        }

        Ok(self.integral())
    }
}

impl<T: Float> Add for RiemannEstimators<T> {
    type Output = Self;

    /// Sums over adjacent ranges with identical steps combine into one.
    fn add(self, other: Self) -> Self {
        debug_assert!(self.step == other.step);
        Self {
            sum: self.sum + other.sum,
            step: self.step,
            calls: self.calls + other.calls,
            non_finite_calls: self.non_finite_calls + other.non_finite_calls,
            non_zero_calls: self.non_zero_calls + other.non_zero_calls,
        }
    }
}

/// Sum `integrand` over the points of `rule`.
pub fn integrate<T, I>(integrand: &I, rule: &UniformRule<T>) -> RiemannEstimators<T>
where
    I: Integrand<T> + ?Sized,
    T: Float + FromPrimitive,
{
    RiemannEstimators::from_values(rule.points().map(|x| integrand.call(x)), rule.step())
}

/// Sum `integrand` over the points of `rule` and fail on non-finite values.
pub fn integrate_checked<T, I>(integrand: &I, rule: &UniformRule<T>) -> Result<T>
where
    I: Integrand<T> + ?Sized,
    T: Float + FromPrimitive + Debug,
{
    integrate(integrand, rule).checked()
}
