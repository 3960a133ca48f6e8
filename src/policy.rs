//! Parallelism policy (§4.A): derive the worker slot count from measured
//! cores, a CPU-target percent, a per-core multiplier, and an optional
//! explicit override. Reconfigurable at any time; a new policy only affects
//! runs started after the change.

/// Detect the number of cores this process can actually use.
///
/// Prefers the CPU affinity mask (Linux `sched_getaffinity`) over the total
/// logical CPU count, since a worker confined to a cgroup or cpuset should
/// size its pool to what it can schedule onto, not the whole machine. Falls
/// back to `num_cpus::get()` when the affinity query is unavailable (e.g.
/// non-Linux, or permission denied).
pub fn detect_cpu_cores() -> usize {
    affinity_core_count().unwrap_or_else(num_cpus::get).max(1)
}

#[cfg(target_os = "linux")]
fn affinity_core_count() -> Option<usize> {
    use std::mem::{MaybeUninit, size_of};

    unsafe {
        let mut set = MaybeUninit::<libc::cpu_set_t>::zeroed();
        let rc = libc::sched_getaffinity(0, size_of::<libc::cpu_set_t>(), set.as_mut_ptr());
        if rc != 0 {
            return None;
        }
        let set = set.assume_init();
        let count = libc::CPU_COUNT(&set) as usize;
        if count == 0 { None } else { Some(count) }
    }
}

#[cfg(not(target_os = "linux"))]
fn affinity_core_count() -> Option<usize> {
    None
}

/// Inputs to the parallelism derivation, reconfigurable between runs.
#[derive(Debug, Clone, Copy)]
pub struct ParallelismPolicy {
    pub cpu_cores: usize,
    pub cpu_target_percent: u32,
    pub parallel_per_core: usize,
    pub explicit_parallel: Option<usize>,
}

impl ParallelismPolicy {
    pub fn new(cpu_cores: usize) -> Self {
        Self {
            cpu_cores: cpu_cores.max(1),
            cpu_target_percent: 65,
            parallel_per_core: 1,
            explicit_parallel: None,
        }
    }

    /// Resolve the number of worker slots a run started right now would get.
    ///
    /// ```text
    /// base   = min(cores, cores/2 + 1)
    /// top    = max(base, floor(cores * 0.95))
    /// explicit_parallel set             => max(1, explicit_parallel)
    /// target_pct <= 65 or top <= base    => base * per_core
    /// else:
    ///     ratio = (target_pct - 65) / 30, clamped to [0, 1]
    ///     auto_slots = round(base + (top - base) * ratio), clamped to [1, cores]
    ///     max_parallel = max(1, auto_slots * per_core)
    /// ```
    pub fn resolve_max_parallel(&self) -> usize {
        if let Some(explicit) = self.explicit_parallel {
            return explicit.max(1);
        }

        let cores = self.cpu_cores;
        let base = cores.min(cores / 2 + 1);
        let top = base.max((cores as f64 * 0.95).floor() as usize);

        let target_pct = self.cpu_target_percent;
        let auto_slots = if target_pct <= 65 || top <= base {
            base
        } else {
            let ratio = ((target_pct - 65) as f64 / 30.0).clamp(0.0, 1.0);
            let raw = base as f64 + (top - base) as f64 * ratio;
            (raw.round() as usize).clamp(1, cores)
        };

        (auto_slots * self.parallel_per_core).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_65_equals_base_times_per_core() {
        for cores in [1, 2, 4, 8, 16, 32] {
            let mut policy = ParallelismPolicy::new(cores);
            policy.cpu_target_percent = 65;
            let base = cores.min(cores / 2 + 1);
            assert_eq!(policy.resolve_max_parallel(), base);
        }
    }

    #[test]
    fn monotone_in_target_percent_for_fixed_cores() {
        let cores = 16;
        let mut prev = 0;
        for target in [65, 70, 75, 80, 85, 90, 95] {
            let mut policy = ParallelismPolicy::new(cores);
            policy.cpu_target_percent = target;
            let slots = policy.resolve_max_parallel();
            assert!(slots >= prev, "target {target} gave {slots} < prev {prev}");
            prev = slots;
        }
    }

    #[test]
    fn explicit_parallel_overrides_everything() {
        let mut policy = ParallelismPolicy::new(4);
        policy.cpu_target_percent = 95;
        policy.parallel_per_core = 3;
        policy.explicit_parallel = Some(2);
        assert_eq!(policy.resolve_max_parallel(), 2);

        policy.explicit_parallel = Some(0);
        assert_eq!(policy.resolve_max_parallel(), 1, "explicit 0 clamps to 1");
    }

    #[test]
    fn per_core_multiplies_auto_slots() {
        let mut policy = ParallelismPolicy::new(8);
        policy.cpu_target_percent = 95;
        policy.parallel_per_core = 1;
        let single = policy.resolve_max_parallel();

        policy.parallel_per_core = 2;
        let doubled = policy.resolve_max_parallel();
        assert_eq!(doubled, single * 2);
    }

    #[test]
    fn single_core_never_resolves_to_zero() {
        let policy = ParallelismPolicy::new(1);
        assert_eq!(policy.resolve_max_parallel(), 1);
    }

    #[test]
    fn target_at_or_below_65_is_flat() {
        let cores = 10;
        let mut p60 = ParallelismPolicy::new(cores);
        p60.cpu_target_percent = 60;
        let mut p65 = ParallelismPolicy::new(cores);
        p65.cpu_target_percent = 65;
        assert_eq!(p60.resolve_max_parallel(), p65.resolve_max_parallel());
    }

    #[test]
    fn target_95_approaches_top() {
        let cores = 16;
        let mut policy = ParallelismPolicy::new(cores);
        policy.cpu_target_percent = 95;
        let base = cores.min(cores / 2 + 1);
        let top = base.max((cores as f64 * 0.95).floor() as usize);
        assert_eq!(policy.resolve_max_parallel(), top);
    }

    #[test]
    fn detect_cpu_cores_is_at_least_one() {
        assert!(detect_cpu_cores() >= 1);
    }
}
