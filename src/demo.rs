//! Demo sequence on the simulated bench.

use seq_core::config::InstrumentConfig;
use seq_core::{CancellationToken, SeqResult};
use seq_experiment::{Instrument, MemorySink, SequenceReport, SequenceStep, FLOWCELLS};
use seq_instrument::{FluidicStep, OpticsSetup, ScanPlan};
use seq_sim::SimBench;
use std::sync::Arc;
use std::time::Duration;

/// One chemistry cycle per flowcell: flow reagent, incubate, image.
pub fn cycle_steps(config: &InstrumentConfig, cycles: u32) -> Vec<SequenceStep> {
    let fluidics = &config.fluidics;
    let reagent_port = fluidics.enabled_ports.get(1).copied().unwrap_or(1);
    let fast = fluidics.max_flow_ul_per_min * f64::from(fluidics.barrels_per_lane);
    let pitch = (16.0 * config.imaging.units_per_line).round() as i64;

    let mut steps = Vec::new();
    for cycle in 0..cycles {
        for (name, ..) in FLOWCELLS {
            steps.push(SequenceStep::fluidic(
                name,
                FluidicStep::Flow {
                    port: reagent_port,
                    volume_ul: fluidics.syringe_volume_ul / 4.0,
                    pull_rate: Some(fast),
                    push_rate: Some(fast),
                    wait: Some(Duration::from_secs(1)),
                },
            ));
            steps.push(SequenceStep::fluidic(
                name,
                FluidicStep::Incubate {
                    temperature: 30.0,
                    duration: Duration::from_secs(1),
                },
            ));
            let y_start = config.stage.home_position.max(config.stage.y.min);
            steps.push(SequenceStep::image(
                name,
                ScanPlan {
                    bundles: 8,
                    frame_height: 16,
                    y_start,
                    y_end: y_start + pitch * 10,
                    velocity: (pitch * 20) as f64,
                    x_position: None,
                    z_position: None,
                    optics: OpticsSetup {
                        green_filter: Some(1),
                        red_filter: Some(1),
                        led: false,
                        green_power_mw: Some(10.0),
                        red_power_mw: Some(10.0),
                    },
                    label: Some(format!("{}:cycle{}", name, cycle + 1)),
                },
            ));
        }
    }
    steps
}

/// Assemble the instrument on a simulated bench and run `cycles` cycles.
pub async fn run_simulated(
    config: &InstrumentConfig,
    cycles: u32,
    token: &CancellationToken,
) -> SeqResult<(SequenceReport, Arc<MemorySink>)> {
    let bench = SimBench::new(config);
    let instrument = Instrument::from_ports(config.clone(), bench.open_all()?)?;
    instrument.initialize().await?;

    let sink = Arc::new(MemorySink::new());
    let report = instrument
        .orchestrator(sink.clone())
        .run_sequence(&cycle_steps(config, cycles), token)
        .await?;
    Ok((report, sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq_experiment::StepAction;

    #[test]
    fn demo_plans_are_valid_for_default_config() {
        let config = InstrumentConfig::default();
        let steps = cycle_steps(&config, 2);
        assert_eq!(steps.len(), 12);
        for step in &steps {
            if let StepAction::Image(plan) = &step.action {
                plan.validate(&config.stage, &config.camera, &config.imaging)
                    .unwrap();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_simulated_cycle_completes() {
        let mut config = InstrumentConfig::default();
        config.camera.frame_width = 64;
        let (report, sink) = run_simulated(&config, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report);
        assert_eq!(sink.len(), 2);
    }
}
