//! Cycle-driven job queue.
//!
//! Jobs are held in a list sorted by due time, delta-encoded: the head's
//! `time` is the number of cycles from now, every other entry is the
//! increment over its predecessor. The main loop charges each retired
//! instruction against the head and dispatches when it reaches zero.

/// Everything that can be scheduled. A closed enum rather than a callback
/// pointer: each kind is dispatched by the emulator loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    TickRestart,
    TickOneShot,
    TickRaise,
    PicDeliver,
    RspPoll,
    CtrlCPoll,
}

#[derive(Debug, Clone, Copy)]
struct Job {
    kind: JobKind,
    /// Cycles after the predecessor job (absolute for the head). Signed so
    /// an overrun carries cleanly onto the successor.
    time: i64,
}

pub struct Scheduler {
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { jobs: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    /// Insert a job `delay` cycles from now.
    pub fn add(&mut self, kind: JobKind, delay: i64) {
        let mut remaining = delay;
        let mut idx = 0;
        while idx < self.jobs.len() && self.jobs[idx].time <= remaining {
            remaining -= self.jobs[idx].time;
            idx += 1;
        }
        if idx < self.jobs.len() {
            self.jobs[idx].time -= remaining;
        }
        self.jobs.insert(
            idx,
            Job {
                kind,
                time: remaining,
            },
        );
    }

    /// Remove the first job of this kind, folding its delta onto the
    /// successor so later due times are unchanged.
    pub fn find_remove(&mut self, kind: JobKind) {
        if let Some(idx) = self.jobs.iter().position(|j| j.kind == kind) {
            let removed = self.jobs.remove(idx);
            if let Some(next) = self.jobs.get_mut(idx) {
                next.time += removed.time;
            }
        }
    }

    /// Charge elapsed cycles against the head job.
    pub fn advance(&mut self, cycles: i64) {
        if let Some(head) = self.jobs.first_mut() {
            head.time -= cycles;
        }
    }

    pub fn head_time(&self) -> Option<i64> {
        self.jobs.first().map(|j| j.time)
    }

    pub fn head_due(&self) -> bool {
        self.jobs.first().map_or(false, |j| j.time <= 0)
    }

    /// Unlink and return the head if it is due. Any overrun is carried onto
    /// the new head.
    pub fn pop_due(&mut self) -> Option<JobKind> {
        if !self.head_due() {
            return None;
        }
        let head = self.jobs.remove(0);
        if let Some(next) = self.jobs.first_mut() {
            next.time += head.time;
        }
        Some(head.kind)
    }

    /// Cycles until the given job runs, if scheduled. Monitor/debug use only.
    pub fn time_of(&self, kind: JobKind) -> Option<i64> {
        let mut acc = 0;
        for j in &self.jobs {
            acc += j.time;
            if j.kind == kind {
                return Some(acc);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_keeps_delta_encoding() {
        let mut s = Scheduler::new();
        s.add(JobKind::TickRaise, 100);
        s.add(JobKind::CtrlCPoll, 30);
        s.add(JobKind::PicDeliver, 60);
        assert_eq!(s.time_of(JobKind::CtrlCPoll), Some(30));
        assert_eq!(s.time_of(JobKind::PicDeliver), Some(60));
        assert_eq!(s.time_of(JobKind::TickRaise), Some(100));
    }

    #[test]
    fn removal_propagates_delta_to_successor() {
        let mut s = Scheduler::new();
        s.add(JobKind::TickRestart, 50);
        s.add(JobKind::TickRaise, 50);
        s.add(JobKind::CtrlCPoll, 80);
        s.find_remove(JobKind::TickRestart);
        assert_eq!(s.time_of(JobKind::TickRaise), Some(50));
        assert_eq!(s.time_of(JobKind::CtrlCPoll), Some(80));
    }

    #[test]
    fn overrun_carries_to_next_job() {
        let mut s = Scheduler::new();
        s.add(JobKind::TickRaise, 10);
        s.add(JobKind::CtrlCPoll, 25);
        s.advance(13); // three cycles past the first job
        assert!(s.head_due());
        assert_eq!(s.pop_due(), Some(JobKind::TickRaise));
        // second job was due at 25; 13 already elapsed
        assert_eq!(s.time_of(JobKind::CtrlCPoll), Some(12));
        assert!(!s.head_due());
        assert_eq!(s.pop_due(), None);
    }

    #[test]
    fn zero_delay_job_runs_before_everything() {
        let mut s = Scheduler::new();
        s.add(JobKind::TickRaise, 40);
        s.add(JobKind::PicDeliver, 0);
        s.advance(0);
        assert_eq!(s.pop_due(), Some(JobKind::PicDeliver));
        assert_eq!(s.time_of(JobKind::TickRaise), Some(40));
    }
}
