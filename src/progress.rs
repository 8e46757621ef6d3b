//! Send progress reporting.
//!
//! Long transfers (package downloads) are cut into pages; after each page is
//! queued the endpoint tells a [`ProgressObserver`] how far it got. The
//! observer is called at most once per `frequency` bytes, plus once when the
//! transfer completes.

/// Receives `(total, done)` byte counts during a send.
pub trait ProgressObserver: Send + Sync {
    fn progress(&self, total: usize, done: usize);
}

impl<F> ProgressObserver for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn progress(&self, total: usize, done: usize) {
        self(total, done)
    }
}

/// Rate-limits calls into an observer.
pub(crate) struct ProgressReporter<'a> {
    observer: &'a dyn ProgressObserver,
    total: usize,
    frequency: usize,
    last_reported: Option<usize>,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(observer: &'a dyn ProgressObserver, total: usize, frequency: usize) -> Self {
        Self {
            observer,
            total,
            frequency: frequency.max(1),
            last_reported: None,
        }
    }

    /// Record that `done` bytes have been sent so far.
    pub(crate) fn advance(&mut self, done: usize) {
        let due = match self.last_reported {
            None => true,
            Some(last) => done >= self.total || done - last >= self.frequency,
        };
        if due && self.last_reported != Some(done) {
            self.last_reported = Some(done);
            self.observer.progress(self.total, done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_reports_start_interval_and_end() {
        let calls = Mutex::new(Vec::new());
        let observer = |total: usize, done: usize| calls.lock().unwrap().push((total, done));

        let mut reporter = ProgressReporter::new(&observer, 1000, 300);
        for done in (0..=1000).step_by(100) {
            reporter.advance(done);
        }

        assert_eq!(
            *calls.lock().unwrap(),
            vec![(1000, 0), (1000, 300), (1000, 600), (1000, 900), (1000, 1000)]
        );
    }

    #[test]
    fn test_repeated_position_reported_once() {
        let calls = Mutex::new(0);
        let observer = |_: usize, _: usize| *calls.lock().unwrap() += 1;

        let mut reporter = ProgressReporter::new(&observer, 0, 0);
        reporter.advance(0);
        reporter.advance(0);

        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
