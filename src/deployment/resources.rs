//! Resource envelopes reserved with admission control.

use crate::template::StrategyType;

use super::errors::DeploymentResult;
use super::types::Deployment;

/// Peak of `i * r_old + j * r_new` while a rolling update replaces
/// `scale_old` instances of size `r_old` with `scale_new` of size `r_new`.
///
/// The first step takes down `max_unavailable` old instances and brings up
/// `max_surge + max_unavailable` new ones; after that one old instance is
/// swapped for one new instance until the update completes.
pub fn calculate_max_resource(
    r_old: f64,
    r_new: f64,
    scale_old: u32,
    scale_new: u32,
    max_surge: u32,
    max_unavailable: u32,
) -> f64 {
    let total = |old: u32, new: u32| old as f64 * r_old + new as f64 * r_new;

    let mut max = total(scale_old, 0).max(total(0, scale_new));
    let max_unavailable = max_unavailable.min(scale_old);
    let max_surge = max_surge.min(scale_new);

    let mut old = scale_old - max_unavailable;
    let mut new = (max_surge + max_unavailable).min(scale_new);
    max = max.max(total(old, new));

    while old > 0 && new < scale_new {
        old -= 1;
        new += 1;
        max = max.max(total(old, new));
    }
    max
}

fn effective_scale(deployment: &Deployment) -> u32 {
    deployment.min_scale().max(1)
}

/// (cpu, mem) reserved for a deployment at its configured scale
pub fn max_resources(deployment: &Deployment) -> (f64, f64) {
    let (cpu, mem) = deployment.template.instance_resources();
    let scale = effective_scale(deployment) as f64;
    (cpu * scale, mem * scale)
}

/// (cpu, mem) that covers every intermediate state of upgrading `old` to `new`
pub fn max_resources_for_upgrade(old: &Deployment, new: &Deployment) -> DeploymentResult<(f64, f64)> {
    match old.template.strategy_type()? {
        StrategyType::RollingUpdate => {
            let (cpu_old, mem_old) = old.template.instance_resources();
            let (cpu_new, mem_new) = new.template.instance_resources();
            let (scale_old, scale_new) = (effective_scale(old), effective_scale(new));
            let (surge, unavailable) = old.template.rolling_update_limits();
            Ok((
                calculate_max_resource(cpu_old, cpu_new, scale_old, scale_new, surge, unavailable),
                calculate_max_resource(mem_old, mem_new, scale_old, scale_new, surge, unavailable),
            ))
        }
        StrategyType::Recreate => {
            let (cpu_old, mem_old) = max_resources(old);
            let (cpu_new, mem_new) = max_resources(new);
            Ok((cpu_old.max(cpu_new), mem_old.max(mem_new)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::test_support::deployment_with;
    use proptest::prelude::*;

    #[test]
    fn test_rolling_surge_envelope() {
        assert_eq!(calculate_max_resource(1.0, 1.0, 5, 5, 2, 0), 7.0);
        assert_eq!(calculate_max_resource(100.0, 100.0, 5, 5, 2, 0), 700.0);
    }

    #[test]
    fn test_unavailable_lowers_peak() {
        assert_eq!(calculate_max_resource(1.0, 1.0, 5, 5, 1, 2), 6.0);
        assert_eq!(calculate_max_resource(1.0, 1.0, 5, 5, 0, 1), 5.0);
    }

    #[test]
    fn test_upgrade_envelope_uses_old_strategy() {
        let old = deployment_with(5, "1", "100", Some(("rolling_update", "2", "0")));
        let new = deployment_with(5, "1", "100", None);
        assert_eq!(max_resources_for_upgrade(&old, &new).unwrap(), (7.0, 700.0));

        let recreate = deployment_with(2, "1", "100", Some(("recreate", "", "")));
        let bigger = deployment_with(3, "2", "50", None);
        assert_eq!(
            max_resources_for_upgrade(&recreate, &bigger).unwrap(),
            (6.0, 200.0)
        );
    }

    proptest! {
        #[test]
        fn envelope_covers_both_endpoints(
            r_old in 0.0f64..8.0,
            r_new in 0.0f64..8.0,
            scale_old in 0u32..12,
            scale_new in 0u32..12,
            surge in 0u32..4,
            unavailable in 0u32..4,
        ) {
            let max = calculate_max_resource(r_old, r_new, scale_old, scale_new, surge, unavailable);
            prop_assert!(max >= r_old * scale_old as f64 - 1e-9);
            prop_assert!(max >= r_new * scale_new as f64 - 1e-9);
            prop_assert!(max <= r_old * scale_old as f64 + r_new * scale_new as f64 + 1e-9);
        }
    }
}
