//! Voltage ramps and IV curves.
//!
//! [`RampController`] drives an [`InstrumentSession`] through a monotonic
//! voltage sweep, dwelling at each point before taking one current reading.
//! A sweep stops early, without error, once the measured current magnitude
//! exceeds 95% of the compliance limit; the point that crossed the margin is
//! still recorded. The return half of an IV curve has no such stop: it
//! always steps back to the start voltage.
//!
//! Dwell goes through a [`Clock`], so tests run against tokio's paused clock
//! instead of waiting for real settling time.

use crate::adapters::Transport;
use crate::data::{Sample, SampleLog};
use crate::error::{AppResult, DaqError};
use crate::instrument::{
    InstrumentSession, OutputElement, SenseFunction, SenseRange, SourceFunction,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fraction of the compliance limit at which a sweep stops.
pub const COMPLIANCE_MARGIN: f64 = 0.95;

/// Most target points a single sweep may have.
pub const MAX_RAMP_POINTS: usize = 100_000;

/// Time source for dwell and sample timestamps.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
    /// Wait for `duration`
    async fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Parameters of one directional sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct RampConfig {
    /// First target voltage
    pub start_voltage: f64,
    /// Last target voltage; an off-grid value is not overshot
    pub stop_voltage: f64,
    /// Signed step; must point from start towards stop
    pub step_voltage: f64,
    /// Settling time before each reading
    pub dwell: Duration,
    /// Current compliance limit in amps
    pub max_current: f64,
    /// Fixed current range for the first point; `None` leaves it untouched
    pub initial_current_range: Option<f64>,
    /// Stop once |I| exceeds [`COMPLIANCE_MARGIN`] of `max_current`
    pub stop_on_compliance: bool,
}

impl RampConfig {
    /// Target voltages from start to stop inclusive.
    ///
    /// A stop voltage off the step grid is not overshot: the last target is
    /// the final grid point before it.
    pub fn targets(&self) -> AppResult<Vec<f64>> {
        let (start, stop, step) = (self.start_voltage, self.stop_voltage, self.step_voltage);
        if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
            return Err(DaqError::invalid("Ramp bounds and step must be finite"));
        }
        if step == 0.0 {
            return Err(DaqError::invalid("Ramp step must be non-zero"));
        }
        let span = stop - start;
        if span != 0.0 && span.signum() != step.signum() {
            return Err(DaqError::invalid(format!(
                "Step {} V does not move from {} V towards {} V",
                step, start, stop
            )));
        }

        let steps = (span / step + 1e-9).floor();
        if steps >= MAX_RAMP_POINTS as f64 {
            return Err(DaqError::invalid(format!(
                "Ramp {} V -> {} V in {} V steps exceeds {} points",
                start, stop, step, MAX_RAMP_POINTS
            )));
        }
        let count = steps as usize;
        Ok((0..=count).map(|i| start + i as f64 * step).collect())
    }

    /// Same parameters, sweeping from `start` back to this ramp's start.
    ///
    /// The return sweep never stops on compliance, so the source always
    /// ends at the original start voltage.
    pub fn return_from(&self, start: f64) -> Self {
        let direction = if self.start_voltage < start { -1.0 } else { 1.0 };
        Self {
            start_voltage: start,
            stop_voltage: self.start_voltage,
            step_voltage: self.step_voltage.abs() * direction,
            stop_on_compliance: false,
            ..self.clone()
        }
    }
}

/// Both halves of an IV curve, kept separate.
///
/// Each half is timed from its own start. `down_offset_seconds` places the
/// down half on the up half's time axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IvCurve {
    /// Sweep from the start voltage outwards
    pub up: SampleLog,
    /// Return sweep back to the start voltage
    pub down: SampleLog,
    /// Start of the down sweep, in seconds after the start of the up sweep
    pub down_offset_seconds: f64,
}

impl IvCurve {
    /// Up then down samples on one time axis, measured from the start of
    /// the up sweep. Time never decreases across the turn.
    pub fn combined(&self) -> SampleLog {
        let mut log = self.up.clone();
        for s in self.down.iter() {
            log.push(Sample::new(
                s.elapsed_seconds + self.down_offset_seconds,
                s.voltage,
                s.current,
            ));
        }
        log
    }
}

/// Drives sweeps over a session.
#[derive(Debug, Clone, Default)]
pub struct RampController<C: Clock = TokioClock> {
    clock: C,
}

impl RampController<TokioClock> {
    /// Controller on the tokio clock.
    pub fn new() -> Self {
        Self { clock: TokioClock }
    }
}

impl<C: Clock> RampController<C> {
    /// Use a custom time source.
    pub fn with_clock(clock: C) -> Self {
        Self { clock }
    }

    /// Run one directional sweep and return the recorded samples.
    pub async fn ramp_voltage<T: Transport>(
        &self,
        session: &mut InstrumentSession<T>,
        config: &RampConfig,
    ) -> AppResult<SampleLog> {
        let started = self.clock.now();
        self.sweep(session, config, started).await
    }

    /// Sweep with sample times measured from `started`.
    async fn sweep<T: Transport>(
        &self,
        session: &mut InstrumentSession<T>,
        config: &RampConfig,
        started: Instant,
    ) -> AppResult<SampleLog> {
        let targets = config.targets()?;
        info!(
            "Ramping {} V -> {} V in {} steps (dwell {:?}, compliance {:e} A)",
            config.start_voltage,
            config.stop_voltage,
            targets.len(),
            config.dwell,
            config.max_current
        );

        session.set_output_format(&[OutputElement::Current]).await?;
        let mut log = SampleLog::new();

        for (index, &voltage) in targets.iter().enumerate() {
            let range = if index == 0 {
                config.initial_current_range.map(SenseRange::Fixed)
            } else {
                Some(SenseRange::Auto)
            };
            configure_point(session, voltage, config.max_current, range).await?;

            self.clock.sleep(config.dwell).await;
            let reading = session.measure_values().await?;
            let current = *reading
                .first()
                .ok_or_else(|| DaqError::protocol("Empty measurement reading"))?;
            let elapsed = self.clock.now().duration_since(started).as_secs_f64();
            log.push(Sample::new(elapsed, voltage, current));
            info!(
                "Point {}/{}: {} V, {:e} A at {:.1} s",
                index + 1,
                targets.len(),
                voltage,
                current,
                elapsed
            );

            if current.abs() > COMPLIANCE_MARGIN * config.max_current {
                if config.stop_on_compliance {
                    warn!(
                        "Current {:e} A exceeds {}% of compliance at {} V; stopping ramp",
                        current,
                        COMPLIANCE_MARGIN * 100.0,
                        voltage
                    );
                    break;
                }
                warn!(
                    "Current {:e} A exceeds {}% of compliance at {} V; continuing to {} V",
                    current,
                    COMPLIANCE_MARGIN * 100.0,
                    voltage,
                    config.stop_voltage
                );
            }
        }
        Ok(log)
    }

    /// Reset, ramp up, ramp back down from where the up-ramp ended, then
    /// de-energize the output.
    pub async fn make_iv_curve<T: Transport>(
        &self,
        session: &mut InstrumentSession<T>,
        config: &RampConfig,
    ) -> AppResult<IvCurve> {
        session.reset().await?;
        let up_started = self.clock.now();
        let up = self.sweep(session, config, up_started).await?;

        let turn = up
            .last()
            .map(|s| s.voltage)
            .unwrap_or(config.start_voltage);
        let down_started = self.clock.now();
        let down = self
            .sweep(session, &config.return_from(turn), down_started)
            .await?;

        session.set_output(false).await?;
        info!(
            "IV curve done: {} up, {} down samples",
            up.len(),
            down.len()
        );
        Ok(IvCurve {
            up,
            down,
            down_offset_seconds: down_started.duration_since(up_started).as_secs_f64(),
        })
    }

    /// Step the source voltage towards 0 V by `step`, pausing `delay`
    /// between steps, then set 0 V and de-energize the output.
    pub async fn ramp_to_zero<T: Transport>(
        &self,
        session: &mut InstrumentSession<T>,
        step: f64,
        delay: Duration,
    ) -> AppResult<()> {
        if !(step.is_finite() && step > 0.0) {
            return Err(DaqError::invalid(format!(
                "Shutdown step must be positive, got {}",
                step
            )));
        }

        let mut level = session.source_level(SourceFunction::Voltage).await?;
        if !session.mode().is_sourcing(SourceFunction::Voltage) {
            session.set_source_mode(SourceFunction::Voltage).await?;
        }
        debug!("Ramping down from {} V", level);

        while level.abs() > step {
            level -= step * level.signum();
            session
                .set_source_level(SourceFunction::Voltage, level)
                .await?;
            self.clock.sleep(delay).await;
        }
        session.set_source_level(SourceFunction::Voltage, 0.0).await?;
        session.set_output(false).await
    }
}

/// Configure the instrument for one ramp point: voltage out, current in.
async fn configure_point<T: Transport>(
    session: &mut InstrumentSession<T>,
    voltage: f64,
    max_current: f64,
    range: Option<SenseRange>,
) -> AppResult<()> {
    session
        .set_sense_enabled(SenseFunction::Voltage, false)
        .await?;
    session
        .set_sense_enabled(SenseFunction::Resistance, false)
        .await?;
    if !session.mode().is_sourcing(SourceFunction::Voltage) {
        session.set_source_mode(SourceFunction::Voltage).await?;
    }
    session.set_current_compliance_limit(max_current).await?;
    if let Some(range) = range {
        session.set_current_range(range).await?;
    }
    session
        .set_source_level(SourceFunction::Voltage, voltage)
        .await?;
    if !session.mode().is_sensing(SenseFunction::Current) {
        session
            .set_sense_enabled(SenseFunction::Current, true)
            .await?;
    }
    if !session.mode().output_energized {
        session.set_output(true).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use approx::assert_relative_eq;
    use tracing_test::traced_test;

    fn config(start: f64, stop: f64, step: f64) -> RampConfig {
        RampConfig {
            start_voltage: start,
            stop_voltage: stop,
            step_voltage: step,
            dwell: Duration::from_secs(2),
            max_current: 1e-6,
            initial_current_range: Some(1.05e-6),
            stop_on_compliance: true,
        }
    }

    /// Session whose `:READ?` replies walk through `currents`, repeating the
    /// last one.
    async fn scripted(currents: Vec<f64>) -> (InstrumentSession<MockTransport>, MockTransport) {
        let mut index = 0;
        let link = MockTransport::new().with_responder(move |cmd| {
            if cmd == ":READ?" {
                let value = currents[index.min(currents.len() - 1)];
                index += 1;
                Some(format!("{:E}", value))
            } else {
                None
            }
        });
        let sent = link.clone();
        let mut session = InstrumentSession::connect(link).await.unwrap();
        session.reset().await.unwrap();
        sent.clear_log();
        (session, sent)
    }

    #[test]
    fn test_targets() {
        assert_eq!(config(0., 10., 5.).targets().unwrap(), vec![0., 5., 10.]);
        assert_eq!(config(10., 0., -5.).targets().unwrap(), vec![10., 5., 0.]);
        assert_eq!(config(0., 10., 3.).targets().unwrap(), vec![0., 3., 6., 9.]);
        assert_eq!(config(4., 4., 1.).targets().unwrap(), vec![4.]);
        assert_eq!(config(0., 1., 0.1).targets().unwrap().len(), 11);

        for bad in [
            config(0., 10., 0.),
            config(0., 10., -1.),
            config(10., 0., 1.),
            config(0., 10., 1e-300),
            config(0., 1e6, 1.),
        ] {
            assert!(matches!(bad.targets(), Err(DaqError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_return_from() {
        let down = config(0., 50., 5.).return_from(35.);
        assert_eq!(down.start_voltage, 35.);
        assert_eq!(down.stop_voltage, 0.);
        assert_eq!(down.step_voltage, -5.);
        assert!(!down.stop_on_compliance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_ramp_records_every_point() {
        let (mut session, sent) = scripted(vec![1e-9]).await;
        let log = RampController::new()
            .ramp_voltage(&mut session, &config(0., 10., 1.))
            .await
            .unwrap();

        assert_eq!(log.len(), 11);
        let voltages: Vec<f64> = log.iter().map(|s| s.voltage).collect();
        assert_eq!(voltages, (0..=10).map(f64::from).collect::<Vec<_>>());
        assert_relative_eq!(log.samples()[0].elapsed_seconds, 2.0, epsilon = 1e-6);
        assert_relative_eq!(log.samples()[10].elapsed_seconds, 22.0, epsilon = 1e-6);

        assert_eq!(sent.count_prefix(":SOUR:VOLT:LEV"), 11);
        assert_eq!(sent.count_prefix(":FORM:ELEM CURR"), 1);
        assert_eq!(sent.count_prefix(":SOUR:FUNC VOLT"), 1);
        assert_eq!(sent.count_prefix(":OUTP ON"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compliance_stop_keeps_crossing_point() {
        let (mut session, sent) = scripted(vec![1e-7, 2e-7, 3e-7, 0.97e-6]).await;
        let log = RampController::new()
            .ramp_voltage(&mut session, &config(0., 10., 1.))
            .await
            .unwrap();

        assert_eq!(log.len(), 4);
        assert_relative_eq!(log.samples()[3].current, 0.97e-6, max_relative = 1e-9);
        assert_eq!(sent.count_prefix(":SOUR:VOLT:LEV"), 4);
        assert_eq!(sent.count_prefix(":READ?"), 4);
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn test_compliance_stop_is_logged() {
        let (mut session, _) = scripted(vec![0.99e-6]).await;
        let log = RampController::new()
            .ramp_voltage(&mut session, &config(0., 10., 1.))
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
        assert!(logs_contain("stopping ramp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_current_counts_towards_compliance() {
        let (mut session, _) = scripted(vec![-1e-8, -0.96e-6]).await;
        let log = RampController::new()
            .ramp_voltage(&mut session, &config(0., -10., -1.))
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_point_uses_initial_range_then_autorange() {
        let (mut session, sent) = scripted(vec![1e-9]).await;
        RampController::new()
            .ramp_voltage(&mut session, &config(0., 2., 1.))
            .await
            .unwrap();

        let ranges: Vec<String> = sent
            .call_log()
            .into_iter()
            .filter(|c| c.starts_with(":SENS:CURR:RANG"))
            .collect();
        assert_eq!(
            ranges,
            vec![
                ":SENS:CURR:RANG 0.00000105",
                ":SENS:CURR:RANG:AUTO ON",
                ":SENS:CURR:RANG:AUTO ON"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_step_sends_nothing() {
        let (mut session, sent) = scripted(vec![1e-9]).await;
        let result = RampController::new()
            .ramp_voltage(&mut session, &config(0., 10., -1.))
            .await;
        assert!(matches!(result, Err(DaqError::InvalidArgument(_))));
        assert!(sent.call_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_iv_curve_returns_from_abort_point() {
        let (mut session, sent) =
            scripted(vec![1e-8, 2e-8, 0.99e-6, 1e-8, 1e-8, 1e-8]).await;
        let curve = RampController::new()
            .make_iv_curve(&mut session, &config(0., 50., 5.))
            .await
            .unwrap();

        let up: Vec<f64> = curve.up.iter().map(|s| s.voltage).collect();
        let down: Vec<f64> = curve.down.iter().map(|s| s.voltage).collect();
        assert_eq!(up, vec![0., 5., 10.]);
        assert_eq!(down, vec![10., 5., 0.]);

        let log = sent.call_log();
        assert_eq!(log.first().map(String::as_str), Some("*RST"));
        assert_eq!(log.last().map(String::as_str), Some(":OUTP OFF"));
        assert!(!session.mode().output_energized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iv_curve_steps_back_while_over_compliance() {
        // every reading after the first sits above the stop margin
        let (mut session, sent) = scripted(vec![1e-8, 0.99e-6]).await;
        let curve = RampController::new()
            .make_iv_curve(&mut session, &config(0., 50., 5.))
            .await
            .unwrap();

        let up: Vec<f64> = curve.up.iter().map(|s| s.voltage).collect();
        let down: Vec<f64> = curve.down.iter().map(|s| s.voltage).collect();
        assert_eq!(up, vec![0., 5.]);
        assert_eq!(down, vec![5., 0.]);
        assert!(curve.down.iter().all(|s| s.current > COMPLIANCE_MARGIN * 1e-6));

        let log = sent.call_log();
        let levels: Vec<&str> = log
            .iter()
            .map(String::as_str)
            .filter(|c| c.starts_with(":SOUR:VOLT:LEV "))
            .collect();
        assert_eq!(levels.last(), Some(&":SOUR:VOLT:LEV 0"));
        assert_eq!(log.last().map(String::as_str), Some(":OUTP OFF"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_combined_curve_time_never_decreases() {
        let (mut session, _) = scripted(vec![1e-9]).await;
        let curve = RampController::new()
            .make_iv_curve(&mut session, &config(0., 20., 5.))
            .await
            .unwrap();

        assert_relative_eq!(curve.down_offset_seconds, 10.0, epsilon = 1e-6);
        assert_relative_eq!(curve.down.samples()[0].elapsed_seconds, 2.0, epsilon = 1e-6);

        let combined = curve.combined();
        assert_eq!(combined.len(), 10);
        let times: Vec<f64> = combined.iter().map(|s| s.elapsed_seconds).collect();
        assert!(times.windows(2).all(|w| w[1] >= w[0]), "{:?}", times);
        assert_relative_eq!(times[9], 20.0, epsilon = 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_to_zero_steps_down() {
        let link = MockTransport::new().with_responder(|cmd| {
            (cmd == ":SOUR:VOLT:LEV?").then(|| "+1.200000E+01".to_string())
        });
        let sent = link.clone();
        let mut session = InstrumentSession::connect(link).await.unwrap();

        RampController::new()
            .ramp_to_zero(&mut session, 5.0, Duration::from_millis(500))
            .await
            .unwrap();

        let levels: Vec<String> = sent
            .call_log()
            .into_iter()
            .filter(|c| c.starts_with(":SOUR:VOLT:LEV "))
            .collect();
        assert_eq!(
            levels,
            vec![":SOUR:VOLT:LEV 7", ":SOUR:VOLT:LEV 2", ":SOUR:VOLT:LEV 0"]
        );
        assert_eq!(sent.call_log().last().map(String::as_str), Some(":OUTP OFF"));
    }
}
