//! Acquisition to analysis: ramp over a mock instrument, raw table files,
//! segmentation, bin storage and fits.

use approx::assert_relative_eq;
use iv_daq::adapters::MockTransport;
use iv_daq::analysis::{fit_bin_exponential, timed_linear_fit, ExponentialOptions};
use iv_daq::config::Settings;
use iv_daq::data::{segment, BinCategory, BinStore, Direction, LoadOptions, Sample, SampleLog};
use iv_daq::instrument::InstrumentSession;
use iv_daq::ramp::RampController;

/// Instrument whose leakage current is proportional to the last set voltage.
fn ohmic_instrument(resistance: f64) -> MockTransport {
    let mut volts = 0.0;
    MockTransport::new().with_responder(move |cmd| {
        if let Some(level) = cmd.strip_prefix(":SOUR:VOLT:LEV ") {
            volts = level.parse().unwrap_or(volts);
            None
        } else if cmd == ":READ?" {
            Some(format!("{:E}", volts / resistance))
        } else {
            None
        }
    })
}

/// Test-stand style log: many samples per voltage, current relaxing
/// towards `v * 1e-9` with a 4 s time constant after every step.
fn relaxing_log(voltages: &[f64], per_step: usize) -> SampleLog {
    let mut log = SampleLog::new();
    let mut t = 0.0;
    for &v in voltages {
        for i in 0..per_step {
            let since_step = i as f64;
            let current = v * 1e-9 + 5e-9 * (-since_step / 4.0).exp();
            log.push(Sample::new(t, v, current));
            t += 1.0;
        }
    }
    log
}

#[tokio::test(start_paused = true)]
async fn test_iv_curve_logs_round_trip_through_tables() {
    let settings = Settings::from_toml_str(
        r#"
        [ramp]
        start_voltage = 0.0
        stop_voltage = 20.0
        step_voltage = 5.0
        dwell_secs = 1.0
        max_current = 1.0e-6
        "#,
    )
    .unwrap();

    let mut session = InstrumentSession::connect(ohmic_instrument(1e9))
        .await
        .unwrap();
    let curve = RampController::new()
        .make_iv_curve(&mut session, &settings.ramp_config())
        .await
        .unwrap();

    assert_eq!(curve.up.len(), 5);
    assert_eq!(curve.down.len(), 5);
    assert_relative_eq!(curve.up.samples()[4].current, 20e-9, max_relative = 1e-9);
    assert_relative_eq!(curve.down.samples()[4].current, 0.0, epsilon = 1e-15);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("IVdata_test_up.txt");
    curve.up.write_table(&path).unwrap();
    assert_eq!(SampleLog::load_table(&path, None).unwrap(), curve.up);

    // the joined table feeds segmentation: the turn run stays in time order
    let all = curve.combined();
    let times: Vec<f64> = all.iter().map(|s| s.elapsed_seconds).collect();
    assert!(times.windows(2).all(|w| w[1] >= w[0]), "{:?}", times);

    let segmentation = segment(&all, &Default::default());
    let turn = segmentation
        .interior
        .iter()
        .find(|b| b.voltage == 20)
        .expect("turn-voltage bin");
    assert_eq!(turn.len(), 2);
    assert!(turn.samples[1].elapsed_seconds > turn.samples[0].elapsed_seconds);
    assert!(timed_linear_fit(turn, 0.0, 1e9).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_compliance_abort_still_returns_to_start() {
    // 1 MOhm: 5 V already draws 5 uA, far above the 1 uA compliance.
    // The return sweep still has to bring the source back to 0 V.
    let mut session = InstrumentSession::connect(ohmic_instrument(1e6))
        .await
        .unwrap();
    let settings = Settings::default();
    let curve = RampController::new()
        .make_iv_curve(&mut session, &settings.ramp_config())
        .await
        .unwrap();

    let up: Vec<f64> = curve.up.iter().map(|s| s.voltage).collect();
    let down: Vec<f64> = curve.down.iter().map(|s| s.voltage).collect();
    assert_eq!(up, vec![0.0, 5.0]);
    assert_eq!(down, vec![5.0, 0.0]);
}

#[tokio::test(start_paused = true)]
async fn test_return_sweep_ignores_compliance() {
    // 0.2 uA per volt against 1 uA compliance: everything from 5 V up is over
    let settings = Settings::from_toml_str(
        r#"
        [ramp]
        start_voltage = 0.0
        stop_voltage = 10.0
        step_voltage = 1.0
        dwell_secs = 1.0
        max_current = 1.0e-6
        "#,
    )
    .unwrap();
    let link = ohmic_instrument(5e6);
    let commands = link.clone();
    let mut session = InstrumentSession::connect(link).await.unwrap();
    let curve = RampController::new()
        .make_iv_curve(&mut session, &settings.ramp_config())
        .await
        .unwrap();

    let up: Vec<f64> = curve.up.iter().map(|s| s.voltage).collect();
    let down: Vec<f64> = curve.down.iter().map(|s| s.voltage).collect();
    assert_eq!(up, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(down, vec![5.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
    assert!(curve.down.samples()[0].current > 0.95e-6);

    let log = commands.call_log();
    let tail: Vec<&str> = log.iter().rev().take(2).map(String::as_str).collect();
    assert_eq!(tail, vec![":OUTP OFF", ":READ?"]);
    assert_eq!(
        log.iter().rev().find(|c| c.starts_with(":SOUR:VOLT:LEV ")).map(String::as_str),
        Some(":SOUR:VOLT:LEV 0")
    );
}

#[test]
fn test_segment_store_and_fit() {
    let log = relaxing_log(&[0.0, 5.0, 10.0, 5.0, 0.0], 40);
    let segmentation = segment(&log, &Default::default());
    assert!(segmentation.warnings.is_empty());
    assert_eq!(segmentation.interior.len(), 3);

    let dir = tempfile::tempdir().unwrap();
    let store = BinStore::new(dir.path(), "relax");
    let report = store.save(&segmentation, true).unwrap();
    assert_eq!(report.written.len(), 5);
    assert!(store.path_for(BinCategory::First, 0).exists());

    let bin = store
        .load(BinCategory::Ascending, 10, &LoadOptions::default())
        .unwrap()
        .expect("ascending 10 V bin stored");
    assert_eq!(bin.direction, Direction::Ascending);
    assert_eq!(bin.samples[0].elapsed_seconds, 0.0);

    let fit = fit_bin_exponential(&bin, &ExponentialOptions::default()).unwrap();
    let p = &fit.result.parameters;
    assert_relative_eq!(p[1], 0.25, max_relative = 1e-4);
    assert_relative_eq!(p[2], 10e-9, max_relative = 1e-4);

    let (tail, reached_end) = timed_linear_fit(&bin, 30.0, 1e9).unwrap();
    assert!(reached_end);
    assert!(tail.parameters[0].abs() < 1e-11);

    assert!(store
        .load(BinCategory::Descending, 10, &LoadOptions::default())
        .unwrap()
        .is_none());
}

#[test]
fn test_rescaled_load_in_microamps() {
    let log = relaxing_log(&[0.0, 5.0, 0.0], 10);
    let dir = tempfile::tempdir().unwrap();
    let store = BinStore::new(dir.path(), "scaled");
    store.save(&segment(&log, &Default::default()), false).unwrap();

    let options = LoadOptions {
        current_scale: Some(1e6),
        normalize_time: false,
    };
    let bin = store
        .load(BinCategory::Ascending, 5, &options)
        .unwrap()
        .unwrap();
    assert_eq!(bin.samples[0].elapsed_seconds, 10.0);
    assert_relative_eq!(bin.samples[0].current, 0.010, max_relative = 1e-9);
}
