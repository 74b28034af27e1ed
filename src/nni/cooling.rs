//! Metropolis cooling schedule for the NNI walk (§4.7).
//!
//! `T(t) = max(1e-12, a*alpha^t + b)`, with `a`/`b` chosen so `T(0) ≈ 1`
//! and `T(T_cooldown) ≈ 0`. Grounded in
//! `laml_libs/TopoSearch/Topology_search.py`'s cooling-schedule
//! constants, reproduced exactly (including the defaults).

#[derive(Clone, Copy, Debug)]
pub struct CoolingSchedule {
    a: f64,
    b: f64,
    alpha: f64,
}

impl CoolingSchedule {
    pub fn new(t_cooldown: u32, alpha: f64) -> CoolingSchedule {
        let b = 1.0 / (1.0 - alpha.powi(-(t_cooldown as i32)));
        let a = -b * alpha.powi(-(t_cooldown as i32));
        CoolingSchedule { a, b, alpha }
    }

    pub fn default_schedule() -> CoolingSchedule {
        CoolingSchedule::new(20, 0.9)
    }

    pub fn temperature(&self, t: u32) -> f64 {
        (self.a * self.alpha.powi(t as i32) + self.b).max(1e-12)
    }

    /// Metropolis acceptance probability for a move from `current` to
    /// `candidate` log-likelihood at iteration `t`: 1 if the candidate is
    /// at least as good, else `exp((candidate - current) / T(t))`.
    pub fn acceptance_probability(&self, current: f64, candidate: f64, t: u32) -> f64 {
        if candidate >= current {
            1.0
        } else {
            ((candidate - current) / self.temperature(t)).exp()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_starts_near_one_and_decays_toward_zero() {
        let sched = CoolingSchedule::default_schedule();
        assert!((sched.temperature(0) - 1.0).abs() < 1e-6);
        assert!(sched.temperature(20) < 0.05);
        assert!(sched.temperature(100) >= 0.0);
    }

    #[test]
    fn improving_moves_always_accept() {
        let sched = CoolingSchedule::default_schedule();
        assert_eq!(sched.acceptance_probability(-10.0, -9.0, 5), 1.0);
    }

    #[test]
    fn worsening_moves_become_less_likely_as_search_cools() {
        let sched = CoolingSchedule::default_schedule();
        let early = sched.acceptance_probability(-10.0, -11.0, 0);
        let late = sched.acceptance_probability(-10.0, -11.0, 19);
        assert!(late < early);
    }
}
