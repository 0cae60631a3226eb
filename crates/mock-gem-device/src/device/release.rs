use super::probe::Stage;
use super::MockGemDevice;
use crate::tracker::TeardownStep;

impl MockGemDevice {
    /// Quiesce the device: flush every engine and retire scheduler work until nothing is
    /// outstanding.
    ///
    /// If work is still outstanding once the flush timeout is spent, the tile is wedged: queued
    /// jobs are cancelled and outstanding requests fail with
    /// [`FenceError::Wedged`](gem_sched::FenceError::Wedged). Jobs that are already running are
    /// waited for without bound.
    pub fn flush(&self) {
        let Some(sched) = self.sched.as_deref() else {
            return;
        };

        let mut remaining = self.flush_timeout;
        let mut wedged = false;
        loop {
            self.gt.flush_engines();
            let outstanding = self.gt.retire_requests_timeout(sched, &mut remaining);
            self.tracker.drained(outstanding);
            if outstanding == 0 {
                break;
            }
            if remaining.is_zero() {
                if !wedged {
                    tracing::warn!(
                        outstanding,
                        timeout = ?self.flush_timeout,
                        "flush timed out, wedging"
                    );
                    wedged = true;
                }
                self.gt.set_wedged(Some(sched));
                sched.wait_idle();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Tear the device down. Equivalent to dropping it.
    pub fn destroy(self) {
        drop(self);
    }

    fn teardown_step(&self, step: TeardownStep) {
        self.tracker.teardown_step(step);
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.do_release) {
            self.teardown_step(TeardownStep::DebuggerFini);
            if let Some(debugger) = self.debugger.take() {
                debugger.fini();
            }

            self.teardown_step(TeardownStep::Drain);
            self.flush();

            self.teardown_step(TeardownStep::RemoveEngines);
            self.release_stage(Stage::Engine);

            self.teardown_step(TeardownStep::DrainFreedObjects);
            self.mm.drain_workqueue();
            self.mm.drain_freed_objects();

            self.teardown_step(TeardownStep::FiniGgtt);
            self.release_stage(Stage::Ggtt);

            self.teardown_step(TeardownStep::ReleaseScheduler);
            self.release_stage(Stage::Scheduler);

            self.teardown_step(TeardownStep::LateRelease);
            self.release_stage(Stage::MemoryRegions);

            self.teardown_step(TeardownStep::DestroyWorkqueue);
            self.release_stage(Stage::Workqueue);

            self.teardown_step(TeardownStep::ModeConfigCleanup);
            self.release_stage(Stage::ModeConfig);

            self.teardown_step(TeardownStep::UncoreUninit);
            self.release_stage(Stage::Uncore);
        }

        self.teardown_step(TeardownStep::ReleaseIdentity);
        if let Some(group) = self.group.take() {
            group.release();
        }
        self.pdev = None;

        self.teardown_step(TeardownStep::FreeParams);
        self.params = None;
    }
}

impl Drop for MockGemDevice {
    fn drop(&mut self) {
        self.release();
    }
}
