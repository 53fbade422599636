// =============================================================================
// Black–Scholes pricing, Greeks, and implied volatility
// =============================================================================
//
// Standard European Black–Scholes with continuous compounding. Implied
// volatility uses Newton–Raphson from a fixed initial guess, bracketed to
// [0.001, 5.0], with a bisection step whenever Newton would leave the
// bracket or vega collapses. Non-convergence and below-intrinsic inputs are
// explicit outcomes, never errors: the caller emits the tick without Greeks.
//
// This code never suspends; evaluations run inline on the worker thread.
// =============================================================================

use statrs::distribution::{Continuous, ContinuousCDF, Normal};

use crate::types::OptionKind;

/// Lower bracket for implied volatility.
const IV_MIN: f64 = 0.001;
/// Upper bracket for implied volatility.
const IV_MAX: f64 = 5.0;
/// Deterministic Newton–Raphson seed.
const IV_INITIAL_GUESS: f64 = 0.3;
/// Convergence tolerance on price.
const IV_PRICE_TOL: f64 = 1e-6;
/// Iteration cap.
const IV_MAX_ITERATIONS: u32 = 100;

/// First-order sensitivities of an option price.
///
/// `theta` is per calendar day; `vega` and `rho` are per percentage point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

impl Greeks {
    fn zero() -> Self {
        Self {
            delta: 0.0,
            gamma: 0.0,
            theta: 0.0,
            vega: 0.0,
            rho: 0.0,
        }
    }
}

/// Result of an implied-volatility solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IvOutcome {
    /// Converged within tolerance.
    Converged { sigma: f64, iterations: u32 },
    /// Observed price is below intrinsic value; no volatility reproduces it.
    BelowIntrinsic,
    /// Newton–Raphson failed to converge within the iteration cap.
    NotConverged,
}

impl IvOutcome {
    pub fn sigma(&self) -> Option<f64> {
        match self {
            Self::Converged { sigma, .. } => Some(*sigma),
            _ => None,
        }
    }
}

/// Black–Scholes pricing engine at a fixed risk-free rate.
pub struct GreeksCalculator {
    risk_free_rate: f64,
    normal: Normal,
}

impl GreeksCalculator {
    pub fn new(risk_free_rate: f64) -> Self {
        Self {
            risk_free_rate,
            normal: Normal::new(0.0, 1.0).expect("unit normal parameters are valid"),
        }
    }

    pub fn risk_free_rate(&self) -> f64 {
        self.risk_free_rate
    }

    fn intrinsic(spot: f64, strike: f64, kind: OptionKind) -> f64 {
        match kind {
            OptionKind::Call => (spot - strike).max(0.0),
            OptionKind::Put => (strike - spot).max(0.0),
        }
    }

    fn d1_d2(&self, spot: f64, strike: f64, t: f64, sigma: f64) -> (f64, f64) {
        let vol_sqrt_t = sigma * t.sqrt();
        let d1 = ((spot / strike).ln() + (self.risk_free_rate + 0.5 * sigma * sigma) * t)
            / vol_sqrt_t;
        (d1, d1 - vol_sqrt_t)
    }

    /// Theoretical option price.
    ///
    /// Expired (`t <= 0`) or zero-volatility inputs collapse to intrinsic
    /// value.
    pub fn price(&self, spot: f64, strike: f64, t: f64, sigma: f64, kind: OptionKind) -> f64 {
        if t <= 0.0 || sigma <= 0.0 || spot <= 0.0 || strike <= 0.0 {
            return Self::intrinsic(spot, strike, kind);
        }

        let (d1, d2) = self.d1_d2(spot, strike, t, sigma);
        let discount = (-self.risk_free_rate * t).exp();
        match kind {
            OptionKind::Call => {
                spot * self.normal.cdf(d1) - strike * discount * self.normal.cdf(d2)
            }
            OptionKind::Put => {
                strike * discount * self.normal.cdf(-d2) - spot * self.normal.cdf(-d1)
            }
        }
    }

    /// Full Greeks at the given volatility.
    ///
    /// Edge cases per the pricing policy: `t <= 0` yields all-zero Greeks;
    /// `sigma = 0` yields a step delta with the other Greeks zero.
    pub fn greeks(&self, spot: f64, strike: f64, t: f64, sigma: f64, kind: OptionKind) -> Greeks {
        if t <= 0.0 || spot <= 0.0 || strike <= 0.0 {
            return Greeks::zero();
        }

        if sigma <= 0.0 {
            // Deterministic payoff: delta is a step function.
            let forward_strike = strike * (-self.risk_free_rate * t).exp();
            let delta = match kind {
                OptionKind::Call => {
                    if spot > forward_strike {
                        1.0
                    } else {
                        0.0
                    }
                }
                OptionKind::Put => {
                    if spot < forward_strike {
                        -1.0
                    } else {
                        0.0
                    }
                }
            };
            return Greeks {
                delta,
                ..Greeks::zero()
            };
        }

        let (d1, d2) = self.d1_d2(spot, strike, t, sigma);
        let pdf_d1 = self.normal.pdf(d1);
        let discount = (-self.risk_free_rate * t).exp();
        let sqrt_t = t.sqrt();

        let delta = match kind {
            OptionKind::Call => self.normal.cdf(d1),
            OptionKind::Put => self.normal.cdf(d1) - 1.0,
        };
        let gamma = pdf_d1 / (spot * sigma * sqrt_t);
        let vega = spot * pdf_d1 * sqrt_t / 100.0;

        let theta_annual = match kind {
            OptionKind::Call => {
                -(spot * pdf_d1 * sigma) / (2.0 * sqrt_t)
                    - self.risk_free_rate * strike * discount * self.normal.cdf(d2)
            }
            OptionKind::Put => {
                -(spot * pdf_d1 * sigma) / (2.0 * sqrt_t)
                    + self.risk_free_rate * strike * discount * self.normal.cdf(-d2)
            }
        };
        let theta = theta_annual / 365.0;

        let rho = match kind {
            OptionKind::Call => strike * t * discount * self.normal.cdf(d2) / 100.0,
            OptionKind::Put => -strike * t * discount * self.normal.cdf(-d2) / 100.0,
        };

        Greeks {
            delta,
            gamma,
            theta,
            vega,
            rho,
        }
    }

    /// Solve for the volatility that reproduces `observed_price`.
    pub fn implied_vol(
        &self,
        observed_price: f64,
        spot: f64,
        strike: f64,
        t: f64,
        kind: OptionKind,
    ) -> IvOutcome {
        if t <= 0.0 || spot <= 0.0 || strike <= 0.0 || !observed_price.is_finite() {
            return IvOutcome::NotConverged;
        }

        let intrinsic = Self::intrinsic(spot, strike, kind);
        if observed_price < intrinsic {
            return IvOutcome::BelowIntrinsic;
        }

        let mut sigma = IV_INITIAL_GUESS;
        let mut lo = IV_MIN;
        let mut hi = IV_MAX;

        for iteration in 1..=IV_MAX_ITERATIONS {
            let price = self.price(spot, strike, t, sigma, kind);
            let diff = price - observed_price;

            if diff.abs() < IV_PRICE_TOL {
                return IvOutcome::Converged {
                    sigma,
                    iterations: iteration,
                };
            }

            // Maintain the bracket around the root.
            if diff > 0.0 {
                hi = sigma;
            } else {
                lo = sigma;
            }

            // Raw (unscaled) vega for the Newton step.
            let (d1, _) = self.d1_d2(spot, strike, t, sigma);
            let vega = spot * self.normal.pdf(d1) * t.sqrt();

            let next = if vega > 1e-12 {
                sigma - diff / vega
            } else {
                f64::NAN
            };

            // Fall back to bisection when Newton leaves the bracket.
            sigma = if next.is_finite() && next > lo && next < hi {
                next
            } else {
                0.5 * (lo + hi)
            };
        }

        IvOutcome::NotConverged
    }
}

impl std::fmt::Debug for GreeksCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GreeksCalculator")
            .field("risk_free_rate", &self.risk_free_rate)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> GreeksCalculator {
        GreeksCalculator::new(0.065)
    }

    #[test]
    fn put_call_parity_holds() {
        let c = calc();
        let (spot, strike, t, sigma) = (24_500.0, 24_000.0, 30.0 / 365.0, 0.2);
        let call = c.price(spot, strike, t, sigma, OptionKind::Call);
        let put = c.price(spot, strike, t, sigma, OptionKind::Put);
        let parity = call - put - (spot - strike * (-0.065f64 * t).exp());
        assert!(parity.abs() < 1e-8, "parity violation: {parity}");
    }

    #[test]
    fn expired_option_is_intrinsic_with_zero_greeks() {
        let c = calc();
        assert_eq!(c.price(24_600.0, 24_500.0, 0.0, 0.2, OptionKind::Call), 100.0);
        assert_eq!(c.price(24_400.0, 24_500.0, 0.0, 0.2, OptionKind::Put), 100.0);
        assert_eq!(
            c.greeks(24_600.0, 24_500.0, 0.0, 0.2, OptionKind::Call),
            Greeks {
                delta: 0.0,
                gamma: 0.0,
                theta: 0.0,
                vega: 0.0,
                rho: 0.0
            }
        );
    }

    #[test]
    fn zero_vol_delta_is_a_step() {
        let c = calc();
        let t = 7.0 / 365.0;
        let g_itm = c.greeks(25_000.0, 24_500.0, t, 0.0, OptionKind::Call);
        assert_eq!(g_itm.delta, 1.0);
        assert_eq!(g_itm.gamma, 0.0);

        let g_otm = c.greeks(24_000.0, 24_500.0, t, 0.0, OptionKind::Call);
        assert_eq!(g_otm.delta, 0.0);

        let p_itm = c.greeks(24_000.0, 24_500.0, t, 0.0, OptionKind::Put);
        assert_eq!(p_itm.delta, -1.0);
    }

    #[test]
    fn atm_iv_round_trip_converges_quickly() {
        // spot=24500, strike=24500, T=7/365, sigma=0.18, r=0.065.
        let c = calc();
        let t = 7.0 / 365.0;
        let sigma_true = 0.18;
        let price = c.price(24_500.0, 24_500.0, t, sigma_true, OptionKind::Call);

        match c.implied_vol(price, 24_500.0, 24_500.0, t, OptionKind::Call) {
            IvOutcome::Converged { sigma, iterations } => {
                assert!((sigma - sigma_true).abs() < 1e-4, "sigma={sigma}");
                assert!(iterations <= 20, "took {iterations} iterations");
            }
            other => panic!("expected convergence, got {other:?}"),
        }
    }

    #[test]
    fn iv_round_trip_across_the_vol_surface() {
        let c = calc();
        let t = 14.0 / 365.0;
        for &sigma_true in &[0.05, 0.12, 0.3, 0.8, 1.5, 2.0] {
            for &(spot, strike) in &[(24_500.0, 24_500.0), (24_500.0, 25_000.0), (24_500.0, 23_800.0)] {
                for kind in [OptionKind::Call, OptionKind::Put] {
                    let price = c.price(spot, strike, t, sigma_true, kind);
                    let outcome = c.implied_vol(price, spot, strike, t, kind);
                    let sigma = outcome
                        .sigma()
                        .unwrap_or_else(|| panic!("no convergence at sigma={sigma_true} {kind}"));
                    assert!(
                        (sigma - sigma_true).abs() < 1e-4,
                        "sigma_true={sigma_true} recovered={sigma} ({kind} K={strike})"
                    );
                }
            }
        }
    }

    #[test]
    fn below_intrinsic_is_reported_not_solved() {
        let c = calc();
        let t = 7.0 / 365.0;
        // Deep ITM call quoted below intrinsic (bad print).
        let outcome = c.implied_vol(400.0, 25_000.0, 24_500.0, t, OptionKind::Call);
        assert_eq!(outcome, IvOutcome::BelowIntrinsic);
        assert_eq!(outcome.sigma(), None);
    }

    #[test]
    fn call_delta_bounded_and_monotone_in_spot() {
        let c = calc();
        let t = 7.0 / 365.0;
        let mut prev = -1.0;
        for spot in (23_000..26_000).step_by(250) {
            let g = c.greeks(spot as f64, 24_500.0, t, 0.18, OptionKind::Call);
            assert!(g.delta >= 0.0 && g.delta <= 1.0);
            assert!(g.delta >= prev);
            assert!(g.gamma >= 0.0);
            assert!(g.vega >= 0.0);
            prev = g.delta;
        }
    }
}
