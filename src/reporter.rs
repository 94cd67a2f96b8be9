use crate::codec;
use crate::Report;
use crate::TimedReport;
use std::time::Duration;
use std::time::Instant;

/// A source of monotonic readings, relative to an arbitrary fixed origin.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// The wall clock, backed by [`Instant`].
#[derive(Clone, Copy, Debug)]
pub struct Monotonic {
    origin: Instant,
}

impl Default for Monotonic {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for Monotonic {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl<F: Fn() -> Duration> Clock for F {
    fn now(&self) -> Duration {
        self()
    }
}

/// Timing state of one measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timer {
    start: Duration,
    last: Option<Duration>,
}

impl Timer {
    pub fn new(start: Duration) -> Self {
        Self { start, last: None }
    }

    /// Stamps `report` observed at `now`, returning the next state.
    ///
    /// The first stamp has `delta == timing`. A reading earlier than the last
    /// stamp is treated as the last stamp.
    pub fn stamp(self, now: Duration, report: Report) -> (Timer, TimedReport) {
        let now = match self.last {
            Some(last) => now.max(last),
            None => now.max(self.start),
        };
        let last = self.last.unwrap_or(self.start);
        let timed = TimedReport {
            report,
            timing: millis(now - self.start),
            delta: millis(now - last),
        };
        let timer = Timer {
            start: self.start,
            last: Some(now),
        };
        (timer, timed)
    }
}

/// Stamps the reports of one measurement against a clock.
pub struct Reporter<C = Monotonic> {
    clock: C,
    timer: Timer,
}

impl Reporter<Monotonic> {
    pub fn new() -> Self {
        Self::with_clock(Monotonic::default())
    }
}

impl Default for Reporter<Monotonic> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Reporter<C> {
    /// Starts the timer at the clock's current reading.
    pub fn with_clock(clock: C) -> Self {
        let timer = Timer::new(clock.now());
        Self { clock, timer }
    }

    pub fn stamp(&mut self, report: Report) -> TimedReport {
        let (timer, timed) = self.timer.stamp(self.clock.now(), report);
        self.timer = timer;
        timed
    }

    /// Stamps `report` and serializes it to a frame.
    pub fn encode(&mut self, report: Report) -> String {
        codec::encode(&self.stamp(report))
    }

    pub fn elapsed(&self) -> f64 {
        millis(self.clock.now().saturating_sub(self.timer.start))
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

#[test]
fn test_timer_first_delta_equals_timing() {
    let timer = Timer::new(Duration::from_millis(100));
    let (timer, timed) = timer.stamp(Duration::from_millis(350), Report::chunk("a"));
    assert_eq!(250.0, timed.timing);
    assert_eq!(250.0, timed.delta);
    let (_, timed) = timer.stamp(Duration::from_millis(400), Report::End);
    assert_eq!(300.0, timed.timing);
    assert_eq!(50.0, timed.delta);
}

#[test]
fn test_timer_is_pure() {
    let timer = Timer::new(Duration::ZERO);
    let (first, _) = timer.stamp(Duration::from_millis(10), Report::End);
    let (second, _) = timer.stamp(Duration::from_millis(10), Report::End);
    assert_eq!(first, second);
    assert_eq!(Timer::new(Duration::ZERO), timer);
}

#[test]
fn test_timer_clamps_backwards_clock() {
    let timer = Timer::new(Duration::from_millis(50));
    let (timer, early) = timer.stamp(Duration::from_millis(20), Report::chunk("a"));
    assert_eq!(0.0, early.timing);
    assert_eq!(0.0, early.delta);
    let (timer, forward) = timer.stamp(Duration::from_millis(80), Report::chunk("b"));
    assert_eq!(30.0, forward.timing);
    assert_eq!(30.0, forward.delta);
    let (_, backward) = timer.stamp(Duration::from_millis(60), Report::End);
    assert_eq!(30.0, backward.timing);
    assert_eq!(0.0, backward.delta);
}

#[test]
fn test_reporter_with_clock() {
    let now = std::cell::Cell::new(Duration::from_millis(1_000));
    let mut reporter = Reporter::with_clock(|| now.get());
    now.set(Duration::from_millis(1_120));
    let start = reporter.stamp(Report::start(200, "OK", Default::default()));
    now.set(Duration::from_millis(1_125));
    let chunk = reporter.stamp(Report::chunk("ab"));
    now.set(Duration::from_millis(1_125));
    let end = reporter.stamp(Report::End);
    assert_eq!((120.0, 120.0), (start.timing, start.delta));
    assert_eq!((125.0, 5.0), (chunk.timing, chunk.delta));
    assert_eq!((125.0, 0.0), (end.timing, end.delta));
    assert_eq!(125.0, reporter.elapsed());
}

#[test]
fn test_reporter_encode_frame() {
    let now = std::cell::Cell::new(Duration::ZERO);
    let mut reporter = Reporter::with_clock(|| now.get());
    now.set(Duration::from_micros(2_500));
    let frame = reporter.encode(Report::End);
    assert_eq!("{\"type\":\"end\",\"timing\":2.5,\"delta\":2.5}\n", frame);
}

#[test]
fn test_reporter_monotonic() {
    let mut reporter = Reporter::new();
    let mut previous = reporter.stamp(Report::start(200, "OK", Default::default()));
    assert_eq!(previous.timing, previous.delta);
    for _ in 0..100 {
        let next = reporter.stamp(Report::chunk("x"));
        assert!(next.timing >= previous.timing);
        assert!(next.delta >= 0.0);
        previous = next;
    }
}
