//! Test-sequencing state machine.
//!
//! One FSM instance drives one test-box half. An external caller ticks it
//! at a steady cadence (~1 Hz); each tick runs the current state's action
//! (usually a telemetry poll, possibly logging a sample) and then computes
//! the next state from fresh telemetry, the pending control flag and
//! elapsed time. States are a closed set of tagged variants; transitioning
//! replaces the state value entirely.
//!
//! Failure policy: a single failed read never forces a transition by
//! itself. Only a sustained absence of successful reads (the read
//! timeout) or a per-state timeout aborts the run to idle with the error
//! LED lit. "Stop" is cooperative and takes effect on the next tick.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::constants::*;
use crate::test_box::TestBox;
use crate::test_log::{TelemetrySample, TestLog};

/// Pending control signal, set by the external caller and consumed by the
/// next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    StartTest,
    StartShortTest,
    StartQuickcharge,
    Resume,
    Stop,
}

/// Name of the active state, for the session status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StateName {
    Idle,
    Wait,
    Pretest,
    ChargeTest,
    DischargeTest,
    PostTest,
}

impl StateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateName::Idle => "IDLE",
            StateName::Wait => "WAIT",
            StateName::Pretest => "PRETEST",
            StateName::ChargeTest => "CHARGE_TEST",
            StateName::DischargeTest => "DISCHARGE_TEST",
            StateName::PostTest => "POSTTEST",
        }
    }
}

/// State a wait pause hands over to once its hold time elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextState {
    ChargeTest { quickcharge: bool },
    DischargeTest { quickcharge: bool },
    PostTest,
}

/// Entry and last-known-good-read timestamps carried by every state.
#[derive(Debug, Clone, Copy)]
struct Timers {
    entered: Instant,
    last_good_read: Instant,
}

impl Timers {
    fn new(now: Instant) -> Self {
        Timers {
            entered: now,
            last_good_read: now,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Idle {
        t: Timers,
    },
    Wait {
        t: Timers,
        next: NextState,
        charge_en: bool,
        discharge_en: bool,
    },
    Pretest {
        t: Timers,
        ticks: u32,
        led_on: bool,
    },
    ChargeTest {
        t: Timers,
        quickcharge: bool,
    },
    DischargeTest {
        t: Timers,
        quickcharge: bool,
        led_on: bool,
        debounce: u32,
    },
    PostTest {
        t: Timers,
        ticks: u32,
        led_on: bool,
        pass: bool,
    },
}

impl State {
    fn name(&self) -> StateName {
        match self {
            State::Idle { .. } => StateName::Idle,
            State::Wait { .. } => StateName::Wait,
            State::Pretest { .. } => StateName::Pretest,
            State::ChargeTest { .. } => StateName::ChargeTest,
            State::DischargeTest { .. } => StateName::DischargeTest,
            State::PostTest { .. } => StateName::PostTest,
        }
    }
}

/// Overridable tuning knobs for one FSM instance. Defaults come from
/// [`crate::constants`].
#[derive(Debug, Clone)]
pub struct FsmConfig {
    /// Max time since the last successful read before aborting to idle
    pub read_timeout: Duration,
    /// Hold time of the inter-state wait pause
    pub wait_hold: Duration,
    pub pretest_timeout: Duration,
    pub charge_test_timeout: Duration,
    pub discharge_test_timeout: Duration,
    pub post_test_timeout: Duration,
    /// Ticks between LED blink toggles
    pub blink_period_ticks: u32,
    /// Consecutive low-current ticks before discharge is called done
    pub discharge_debounce_ticks: u32,
    /// Discharge-done current threshold, in mA
    pub discharge_done_thresh_ma: f64,
    /// Directory for durable telemetry logs
    pub log_dir: PathBuf,
}

impl Default for FsmConfig {
    fn default() -> Self {
        FsmConfig {
            read_timeout: READ_TIMEOUT,
            wait_hold: WAIT_HOLD,
            pretest_timeout: PRETEST_TIMEOUT,
            charge_test_timeout: CHARGE_TEST_TIMEOUT,
            discharge_test_timeout: DISCHARGE_TEST_TIMEOUT,
            post_test_timeout: POST_TEST_TIMEOUT,
            blink_period_ticks: BLINK_PERIOD_TICKS,
            discharge_debounce_ticks: DISCHARGE_DEBOUNCE_TICKS,
            discharge_done_thresh_ma: DISCHARGE_DONE_THRESH_MA,
            log_dir: PathBuf::from("test_results"),
        }
    }
}

/// The sequencing core bound to one test-box half.
pub struct Fsm {
    config: FsmConfig,
    state: State,
    flag: Option<Flag>,
    test_log: Option<TestLog>,
    started_at: Option<Instant>,
    charge_setpoint: f64,
    charge_test_level: f64,
    test_pass: bool,
    done: bool,
}

impl Fsm {
    pub fn new(config: FsmConfig) -> Self {
        Fsm {
            config,
            state: State::Idle {
                t: Timers::new(Instant::now()),
            },
            flag: None,
            test_log: None,
            started_at: None,
            charge_setpoint: DEFAULT_CHARGE_SETPOINT_PCT,
            charge_test_level: FULL_TEST_LEVEL_PCT,
            test_pass: false,
            done: false,
        }
    }

    // --- control surface -------------------------------------------------

    /// Request a full (or short) charge/discharge test.
    pub fn start(&mut self, charge_setpoint: f64, short_test: bool) {
        self.charge_setpoint = charge_setpoint;
        self.charge_test_level = if short_test {
            SHORT_TEST_LEVEL_PCT
        } else {
            FULL_TEST_LEVEL_PCT
        };
        self.flag = Some(if short_test {
            Flag::StartShortTest
        } else {
            Flag::StartTest
        });
    }

    /// Request a quickcharge (or quickdischarge) to the given level.
    pub fn start_quickcharge(&mut self, charge_setpoint: f64) {
        self.charge_setpoint = charge_setpoint;
        self.flag = Some(Flag::StartQuickcharge);
    }

    /// Resume an interrupted run; the existing telemetry log is kept.
    pub fn resume(&mut self) {
        self.flag = Some(Flag::Resume);
    }

    /// Cooperative stop; takes effect on the next tick.
    pub fn stop(&mut self) {
        self.flag = Some(Flag::Stop);
    }

    // --- status surface ---------------------------------------------------

    pub fn state_name(&self) -> StateName {
        self.state.name()
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn test_pass(&self) -> bool {
        self.test_pass
    }

    pub fn charge_setpoint(&self) -> f64 {
        self.charge_setpoint
    }

    pub fn charge_test_level(&self) -> f64 {
        self.charge_test_level
    }

    pub fn test_log(&self) -> Option<&TestLog> {
        self.test_log.as_ref()
    }

    /// Elapsed test time of the newest logged sample.
    pub fn test_time(&self) -> Option<Duration> {
        self.test_log.as_ref().map(|l| l.test_time())
    }

    pub fn last_sample(&self) -> Option<TelemetrySample> {
        self.test_log.as_ref().and_then(|l| l.last().copied())
    }

    // --- tick -------------------------------------------------------------

    /// Run one tick: current state's action, then the transition computed
    /// from fresh telemetry, the pending flag and elapsed time. The flag
    /// is consumed either way.
    pub fn tick(&mut self, tbox: &mut TestBox) {
        let flag = self.flag.take();
        let now = Instant::now();
        let state = self.state;
        self.state = match state {
            State::Idle { t } => self.tick_idle(tbox, flag, now, t),
            State::Wait {
                t,
                next,
                charge_en,
                discharge_en,
            } => self.tick_wait(tbox, now, t, next, charge_en, discharge_en),
            State::Pretest { t, ticks, led_on } => {
                self.tick_pretest(tbox, flag, now, t, ticks, led_on)
            }
            State::ChargeTest { t, quickcharge } => {
                self.tick_charge_test(tbox, flag, now, t, quickcharge)
            }
            State::DischargeTest {
                t,
                quickcharge,
                led_on,
                debounce,
            } => self.tick_discharge_test(tbox, flag, now, t, quickcharge, led_on, debounce),
            State::PostTest {
                t,
                ticks,
                led_on,
                pass,
            } => self.tick_post_test(tbox, flag, now, t, ticks, led_on, pass),
        };
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|s| now.duration_since(s))
            .unwrap_or_default()
    }

    /// Reset the session outcome to its baseline for a fresh run.
    fn begin_run(&mut self, now: Instant) {
        self.done = false;
        self.test_pass = false;
        self.started_at = Some(now);
        self.test_log = None;
    }

    // --- per-state ticks --------------------------------------------------

    fn tick_idle(&mut self, tbox: &mut TestBox, flag: Option<Flag>, now: Instant, t: Timers) -> State {
        // the gauge reporting "fully discharged" at idle means its
        // accumulator has drifted; recalibrate it
        if let Ok(cfg) = tbox.gas_gauge.config_reg(&mut tbox.bus) {
            if cfg == CONFIG_DISCHARGED_SENTINEL {
                debug!("idle: discharged sentinel, recalibrating gauge");
                let _ = tbox.gas_gauge.control_init(&mut tbox.bus);
                let _ = tbox.gas_gauge.charge_init(&mut tbox.bus);
            }
        }

        match flag {
            Some(Flag::StartTest) | Some(Flag::StartShortTest) => {
                self.begin_run(now);
                info!("IDLE -> PRETEST");
                self.enter_pretest(tbox, now)
            }
            Some(Flag::StartQuickcharge) => {
                match tbox.gas_gauge.charge_level_pct(&mut tbox.bus) {
                    Ok(level) if level < self.charge_setpoint => {
                        self.begin_run(now);
                        info!("IDLE -> CHARGE_TEST (quickcharge to {}%)", self.charge_setpoint);
                        self.enter_charge_test(tbox, now, true)
                    }
                    Ok(_) => {
                        self.begin_run(now);
                        info!(
                            "IDLE -> DISCHARGE_TEST (quickdischarge to {}%)",
                            self.charge_setpoint
                        );
                        self.enter_discharge_test(tbox, now, true)
                    }
                    Err(e) => {
                        warn!("quickcharge start deferred, telemetry unavailable: {}", e);
                        State::Idle { t }
                    }
                }
            }
            Some(Flag::Resume) => {
                self.done = false;
                self.started_at = self.started_at.or(Some(now));
                info!("IDLE -> CHARGE_TEST (resume)");
                self.enter_charge_test(tbox, now, true)
            }
            _ => State::Idle { t },
        }
    }

    fn tick_wait(
        &mut self,
        tbox: &mut TestBox,
        now: Instant,
        t: Timers,
        next: NextState,
        charge_en: bool,
        discharge_en: bool,
    ) -> State {
        // the hold expiring is a normal transition, not an error; stop and
        // read-timeout do not apply during the short pause
        if now.duration_since(t.entered) >= self.config.wait_hold {
            match next {
                NextState::ChargeTest { quickcharge } => {
                    info!("WAIT -> CHARGE_TEST");
                    self.enter_charge_test(tbox, now, quickcharge)
                }
                NextState::DischargeTest { quickcharge } => {
                    info!("WAIT -> DISCHARGE_TEST");
                    self.enter_discharge_test(tbox, now, quickcharge)
                }
                NextState::PostTest => {
                    info!("WAIT -> POSTTEST");
                    self.enter_post_test(tbox, now)
                }
            }
        } else {
            State::Wait {
                t,
                next,
                charge_en,
                discharge_en,
            }
        }
    }

    fn tick_pretest(
        &mut self,
        tbox: &mut TestBox,
        flag: Option<Flag>,
        now: Instant,
        t: Timers,
        ticks: u32,
        led_on: bool,
    ) -> State {
        let mut t = t;
        let ticks = ticks.wrapping_add(1);
        let mut led_on = led_on;
        if ticks % self.config.blink_period_ticks == 0 {
            led_on = !led_on;
            let _ = tbox.gpio.set_led_run(&mut tbox.bus, led_on);
        }

        let config = tbox.gas_gauge.config_reg(&mut tbox.bus);
        let voltage = tbox.gas_gauge.voltage_mv(&mut tbox.bus);
        if config.is_ok() || voltage.is_ok() {
            t.last_good_read = now;
        }

        if let Some(next) = self.supervise(tbox, flag, now, &t, self.config.pretest_timeout, "PRETEST")
        {
            return next;
        }

        let discharged = matches!(config, Ok(CONFIG_DISCHARGED_SENTINEL));
        let needs_precharge = matches!(voltage, Ok(mv) if mv < PRECHARGE_REQUIRED_MV);
        if discharged || needs_precharge {
            let _ = tbox.gpio.set_discharge_enable(&mut tbox.bus, false);
            if let Err(e) = tbox.gas_gauge.charge_init(&mut tbox.bus) {
                warn!("charge accumulator init failed: {}", e);
            }
            info!("PRETEST -> CHARGE_TEST");
            return self.enter_wait(
                tbox,
                now,
                NextState::ChargeTest { quickcharge: false },
                true,
                false,
            );
        }

        State::Pretest { t, ticks, led_on }
    }

    fn tick_charge_test(
        &mut self,
        tbox: &mut TestBox,
        flag: Option<Flag>,
        now: Instant,
        t: Timers,
        quickcharge: bool,
    ) -> State {
        let mut t = t;
        // manual ADC mode: each tick kicks off one conversion
        let _ = tbox.gas_gauge.control_init(&mut tbox.bus);
        let elapsed = self.elapsed(now);
        let sample = tbox.gas_gauge.get_all(&mut tbox.bus, elapsed);
        if let Ok(s) = &sample {
            t.last_good_read = now;
            if let Some(log) = self.test_log.as_mut() {
                if let Err(e) = log.add_result(*s) {
                    warn!("telemetry log append failed: {}", e);
                }
            }
        }

        if let Some(next) = self.supervise(
            tbox,
            flag,
            now,
            &t,
            self.config.charge_test_timeout,
            "CHARGE_TEST",
        ) {
            return next;
        }

        let target = if quickcharge {
            self.charge_setpoint
        } else {
            self.charge_test_level
        };
        if let Ok(s) = &sample {
            if s.charge_level_pct >= target {
                let _ = tbox.gpio.set_charge_enable(&mut tbox.bus, false);
                if quickcharge {
                    self.done = true;
                    info!("CHARGE_TEST done (quickcharge)");
                    return self.enter_idle(tbox, now);
                }
                info!("CHARGE_TEST -> DISCHARGE_TEST");
                return self.enter_wait(
                    tbox,
                    now,
                    NextState::DischargeTest { quickcharge: false },
                    false,
                    true,
                );
            }
        }

        State::ChargeTest { t, quickcharge }
    }

    fn tick_discharge_test(
        &mut self,
        tbox: &mut TestBox,
        flag: Option<Flag>,
        now: Instant,
        t: Timers,
        quickcharge: bool,
        led_on: bool,
        debounce: u32,
    ) -> State {
        let mut t = t;
        let led_on = !led_on;
        let _ = tbox.gpio.set_led_run(&mut tbox.bus, led_on);

        let _ = tbox.gas_gauge.control_init(&mut tbox.bus);
        let elapsed = self.elapsed(now);
        let sample = tbox.gas_gauge.get_all(&mut tbox.bus, elapsed);
        let config = tbox.gas_gauge.cached_config();
        if let Ok(s) = &sample {
            t.last_good_read = now;
            if let Some(log) = self.test_log.as_mut() {
                if let Err(e) = log.add_result(*s) {
                    warn!("telemetry log append failed: {}", e);
                }
            }
        }

        let mut debounce = debounce;
        if let Ok(s) = &sample {
            if s.current_ma.abs() < self.config.discharge_done_thresh_ma {
                debounce += 1;
            } else {
                debounce = 0;
            }
        }

        if let Some(next) = self.supervise(
            tbox,
            flag,
            now,
            &t,
            self.config.discharge_test_timeout,
            "DISCHARGE_TEST",
        ) {
            return next;
        }

        let discharged = config == Some(CONFIG_DISCHARGED_SENTINEL);
        let level_reached = quickcharge
            && matches!(&sample, Ok(s) if s.charge_level_pct <= self.charge_setpoint);
        if debounce >= self.config.discharge_debounce_ticks || discharged || level_reached {
            let _ = tbox.gpio.set_discharge_enable(&mut tbox.bus, false);
            if quickcharge {
                self.done = true;
                info!("DISCHARGE_TEST done (quickdischarge)");
                return self.enter_idle(tbox, now);
            }
            info!("DISCHARGE_TEST -> POSTTEST");
            return self.enter_wait(tbox, now, NextState::PostTest, true, false);
        }

        State::DischargeTest {
            t,
            quickcharge,
            led_on,
            debounce,
        }
    }

    fn tick_post_test(
        &mut self,
        tbox: &mut TestBox,
        flag: Option<Flag>,
        now: Instant,
        t: Timers,
        ticks: u32,
        led_on: bool,
        pass: bool,
    ) -> State {
        let mut t = t;
        let ticks = ticks.wrapping_add(1);
        let mut led_on = led_on;
        if ticks % self.config.blink_period_ticks == 0 {
            led_on = !led_on;
            let result = if pass {
                tbox.gpio.set_led_done(&mut tbox.bus, led_on)
            } else {
                tbox.gpio.set_led_error(&mut tbox.bus, led_on)
            };
            if let Err(e) = result {
                debug!("verdict LED write failed: {}", e);
            }
        }

        let level = tbox.gas_gauge.charge_level_pct(&mut tbox.bus);
        if level.is_ok() {
            t.last_good_read = now;
        }

        if let Some(next) = self.supervise(
            tbox,
            flag,
            now,
            &t,
            self.config.post_test_timeout,
            "POSTTEST",
        ) {
            return next;
        }

        if let Ok(level) = level {
            if level > self.charge_setpoint {
                let _ = tbox.gas_gauge.control_init(&mut tbox.bus);
                let _ = tbox.gpio.set_charge_enable(&mut tbox.bus, false);
                let _ = tbox.gpio.set_led_run(&mut tbox.bus, false);
                let _ = if pass {
                    tbox.gpio.set_led_done(&mut tbox.bus, true)
                } else {
                    tbox.gpio.set_led_error(&mut tbox.bus, true)
                };
                self.done = true;
                info!("TEST DONE ({})", if pass { "PASS" } else { "FAIL" });
                return self.enter_idle(tbox, now);
            }
        }

        State::PostTest {
            t,
            ticks,
            led_on,
            pass,
        }
    }

    // --- shared transition machinery ---------------------------------------

    /// Default transition check shared by every state except Wait: stop
    /// flag, per-state timeout, read timeout, in that order.
    fn supervise(
        &mut self,
        tbox: &mut TestBox,
        flag: Option<Flag>,
        now: Instant,
        t: &Timers,
        timeout: Duration,
        state_name: &str,
    ) -> Option<State> {
        if matches!(flag, Some(Flag::Stop)) {
            info!("{} stopped", state_name);
            return Some(self.abort_to_idle(tbox, now, false));
        }
        if now.duration_since(t.entered) > timeout {
            error!("{} timed out", state_name);
            return Some(self.abort_to_idle(tbox, now, true));
        }
        if now.duration_since(t.last_good_read) > self.config.read_timeout {
            error!("{} read timeout, aborting", state_name);
            return Some(self.abort_to_idle(tbox, now, true));
        }
        None
    }

    fn abort_to_idle(&mut self, tbox: &mut TestBox, now: Instant, error_led: bool) -> State {
        let _ = tbox.gpio.set_led_run(&mut tbox.bus, false);
        if error_led {
            let _ = tbox.gpio.set_led_error(&mut tbox.bus, true);
        }
        self.enter_idle(tbox, now)
    }

    // --- state entries ------------------------------------------------------

    fn enter_idle(&mut self, tbox: &mut TestBox, now: Instant) -> State {
        if let Err(e) = tbox.gpio.set_charge_enable(&mut tbox.bus, false) {
            warn!("failed to disable charge output: {}", e);
        }
        if let Err(e) = tbox.gpio.set_discharge_enable(&mut tbox.bus, false) {
            warn!("failed to disable discharge output: {}", e);
        }
        State::Idle { t: Timers::new(now) }
    }

    fn enter_wait(
        &mut self,
        tbox: &mut TestBox,
        now: Instant,
        next: NextState,
        charge_en: bool,
        discharge_en: bool,
    ) -> State {
        // disable first so the enables can never overlap
        if !charge_en {
            let _ = tbox.gpio.set_charge_enable(&mut tbox.bus, false);
        }
        if !discharge_en {
            let _ = tbox.gpio.set_discharge_enable(&mut tbox.bus, false);
        }
        if charge_en {
            if let Err(e) = tbox.gpio.set_charge_enable(&mut tbox.bus, true) {
                warn!("failed to enable charge output: {}", e);
            }
        }
        if discharge_en {
            if let Err(e) = tbox.gpio.set_discharge_enable(&mut tbox.bus, true) {
                warn!("failed to enable discharge output: {}", e);
            }
        }
        State::Wait {
            t: Timers::new(now),
            next,
            charge_en,
            discharge_en,
        }
    }

    fn enter_pretest(&mut self, tbox: &mut TestBox, now: Instant) -> State {
        if let Err(e) = tbox.gas_gauge.control_auto(&mut tbox.bus) {
            warn!("failed to select auto ADC mode: {}", e);
        }
        let _ = tbox.gpio.set_charge_enable(&mut tbox.bus, false);
        if let Err(e) = tbox.gpio.set_discharge_enable(&mut tbox.bus, true) {
            warn!("failed to enable discharge output: {}", e);
        }
        let _ = tbox.gpio.set_led_run(&mut tbox.bus, true);
        State::Pretest {
            t: Timers::new(now),
            ticks: 0,
            led_on: true,
        }
    }

    fn enter_charge_test(&mut self, tbox: &mut TestBox, now: Instant, quickcharge: bool) -> State {
        let _ = tbox.gpio.set_discharge_enable(&mut tbox.bus, false);
        if let Err(e) = tbox.gpio.set_charge_enable(&mut tbox.bus, true) {
            warn!("failed to enable charge output: {}", e);
        }
        let _ = tbox.gpio.set_led_run(&mut tbox.bus, true);
        // a full test records to a fresh durable log; quickcharge and
        // resume runs keep whatever log already exists
        if !quickcharge {
            self.test_log = Some(TestLog::create(&self.config.log_dir).unwrap_or_else(|e| {
                warn!("could not create durable log, keeping samples in memory: {}", e);
                TestLog::in_memory()
            }));
        }
        State::ChargeTest {
            t: Timers::new(now),
            quickcharge,
        }
    }

    fn enter_discharge_test(&mut self, tbox: &mut TestBox, now: Instant, quickcharge: bool) -> State {
        let _ = tbox.gpio.set_charge_enable(&mut tbox.bus, false);
        if let Err(e) = tbox.gpio.set_discharge_enable(&mut tbox.bus, true) {
            warn!("failed to enable discharge output: {}", e);
        }
        State::DischargeTest {
            t: Timers::new(now),
            quickcharge,
            led_on: false,
            debounce: 0,
        }
    }

    fn enter_post_test(&mut self, tbox: &mut TestBox, now: Instant) -> State {
        if let Err(e) = tbox.gas_gauge.control_init(&mut tbox.bus) {
            warn!("gauge recalibration failed: {}", e);
        }
        if let Err(e) = tbox.gas_gauge.charge_init(&mut tbox.bus) {
            warn!("charge accumulator restart failed: {}", e);
        }
        let _ = tbox.gpio.set_discharge_enable(&mut tbox.bus, false);
        if let Err(e) = tbox.gpio.set_charge_enable(&mut tbox.bus, true) {
            warn!("failed to enable charge output: {}", e);
        }

        let pass = self.test_log.as_ref().map(TestLog::test_pass).unwrap_or(false);
        self.test_pass = pass;
        info!("test verdict: {}", if pass { "PASS" } else { "FAIL" });
        State::PostTest {
            t: Timers::new(now),
            ticks: 0,
            led_on: false,
            pass,
        }
    }
}
