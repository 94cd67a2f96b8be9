use crate::Report;
use crate::TimedReport;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;

/// Aggregate figures of one measurement, fed report by report.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Summary {
    /// Time until headers arrived
    pub headers: Option<f64>,
    pub chunks: usize,
    /// Time until the origin stream was exhausted
    pub total: Option<f64>,
    pub errors: Vec<String>,
}

impl Summary {
    pub fn add(&mut self, report: &TimedReport) {
        match &report.report {
            Report::Start(_) => self.headers = Some(report.timing),
            Report::Chunk(_) => self.chunks += 1,
            Report::End => self.total = Some(report.timing),
            Report::Error(failure) => self.errors.push(failure.message.to_owned()),
        }
    }

    pub fn failed(&self) -> bool {
        !self.errors.is_empty() || self.total.is_none()
    }
}

impl<'a> FromIterator<&'a TimedReport> for Summary {
    fn from_iter<T: IntoIterator<Item = &'a TimedReport>>(iter: T) -> Self {
        let mut summary = Summary::default();
        for report in iter {
            summary.add(report);
        }
        summary
    }
}

fn millis(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.2}ms"),
        None => String::from("-"),
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "headers={}  chunks={}  total={}  errors={}",
            millis(self.headers),
            self.chunks,
            millis(self.total),
            self.errors.len()
        )
    }
}

#[test]
fn test_summary() {
    let reports = [
        TimedReport {
            report: Report::start(200, "OK", Default::default()),
            timing: 100.0,
            delta: 100.0,
        },
        TimedReport {
            report: Report::chunk("ab"),
            timing: 150.0,
            delta: 50.0,
        },
        TimedReport {
            report: Report::chunk("c"),
            timing: 175.5,
            delta: 25.5,
        },
        TimedReport {
            report: Report::End,
            timing: 176.0,
            delta: 0.5,
        },
    ];
    let summary = reports.iter().collect::<Summary>();
    assert_eq!(Some(100.0), summary.headers);
    assert_eq!(2, summary.chunks);
    assert_eq!(Some(176.0), summary.total);
    assert!(!summary.failed());
    assert_eq!("headers=100.00ms  chunks=2  total=176.00ms  errors=0", summary.to_string());
}

#[test]
fn test_summary_failed() {
    let summary = [TimedReport::failure("Could not fetch")].iter().collect::<Summary>();
    assert!(summary.failed());
    assert_eq!(vec![String::from("Could not fetch")], summary.errors);
    assert_eq!("headers=-  chunks=0  total=-  errors=1", summary.to_string());
}
