#[cfg(test)]
mod proptest_interlock {
    use crate::config::StationConfig;
    use crate::hal_sim::SimulatedPins;
    use crate::hardware::HardwareState;
    use crate::timebase::TimeBase;
    use crate::watcher::{PollDebouncer, SensorTable};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn hardware(config: &StationConfig) -> HardwareState {
        let timebase = TimeBase::new();
        let sensors = Arc::new(SensorTable::from_config(config, timebase));
        HardwareState::new(Box::new(SimulatedPins::new()), config, sensors, timebase).unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        // Property: no command sequence leaves both members of a pair ON,
        // and the requested activation always takes effect
        #[test]
        fn interlocked_pair_never_both_on(
            commands in prop::collection::vec((0usize..8, any::<bool>()), 1..64),
        ) {
            let mut config = StationConfig::default();
            config.interlocks.push(("feeder".to_string(), "torque_mode".to_string()));
            let mut hw = hardware(&config);
            let names: Vec<String> = config.relays.iter().map(|r| r.name.clone()).collect();

            for (idx, on) in commands {
                let name = &names[idx % names.len()];
                hw.set_relay(name, on).unwrap();
                prop_assert_eq!(hw.relay(name).unwrap(), on);
                let satisfied = hw
                    .interlocks()
                    .is_satisfied(|relay| hw.relay(relay).unwrap_or(false));
                prop_assert!(satisfied, "interlock violated after {} -> {}", name, on);
            }
        }

        // Property: a level is published only after `required` consecutive
        // disagreeing samples
        #[test]
        fn short_glitches_never_publish(
            samples in prop::collection::vec(any::<bool>(), 1..200),
            debounce_ms in 1u64..50,
            interval_ms in 1u64..10,
        ) {
            let mut debouncer = PollDebouncer::new(
                false,
                Duration::from_millis(debounce_ms),
                Duration::from_millis(interval_ms),
            );
            let required = debouncer.required();
            prop_assert_eq!(required as u64, debounce_ms.div_ceil(interval_ms).max(1));

            let mut published = false;
            let mut streak = 0u32;
            for level in samples {
                streak = if level != published { streak + 1 } else { 0 };
                match debouncer.observe(level) {
                    Some(new) => {
                        prop_assert_eq!(new, level);
                        prop_assert!(streak >= required);
                        published = new;
                        streak = 0;
                    }
                    None => prop_assert!(streak < required),
                }
                prop_assert_eq!(debouncer.published(), published);
            }
        }
    }
}
