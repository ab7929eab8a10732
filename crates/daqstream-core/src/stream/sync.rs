//! Synchronized start of two tasks sharing a sample clock
//!
//! The follower borrows the leader's sample clock and is triggered by the
//! leader's start edge. The follower must be waiting on that edge before the
//! leader starts, otherwise the edge is missed and the follower never starts.

use crate::stream::channels::Direction;
use crate::stream::clock::ClockSource;
use crate::stream::error::StreamError;
use crate::stream::task::{StreamTask, TaskState};

/// Leader/follower pair bound for a synchronized start
///
/// The clock binding lasts as long as the coordinator. Dropping a coordinator
/// whose follower never started restores the follower's previous clock source.
pub struct SyncCoordinator<'a> {
    leader: &'a mut StreamTask,
    follower: &'a mut StreamTask,
    previous_source: ClockSource,
}

impl<'a> SyncCoordinator<'a> {
    /// Make `follower` borrow `leader`'s sample clock
    ///
    /// Both tasks must be configured.
    ///
    /// # Errors
    /// `InvalidState` if either task is not `Configured`,
    /// `InvalidClockTopology` if the binding would form a clock cycle.
    pub fn bind(
        leader: &'a mut StreamTask,
        follower: &'a mut StreamTask,
    ) -> Result<Self, StreamError> {
        for task in [&*leader, &*follower] {
            let state = task.state();
            if state != TaskState::Configured {
                return Err(StreamError::InvalidState { op: "bind", state });
            }
        }
        if leader.id() == follower.id() {
            return Err(StreamError::InvalidClockTopology(format!(
                "'{}' cannot lead itself",
                leader.name()
            )));
        }

        let previous_source = follower
            .clock()
            .map(|c| c.clock_source)
            .unwrap_or(ClockSource::Internal);
        follower.set_clock_source(ClockSource::External(leader.id()))?;

        tracing::info!(
            leader = %leader.name(),
            follower = %follower.name(),
            "Follower bound to leader clock"
        );
        Ok(Self {
            leader,
            follower,
            previous_source,
        })
    }

    /// Like [`bind`](Self::bind), but the two tasks must move data in
    /// opposite directions
    ///
    /// # Errors
    /// `DirectionMismatch` if both tasks are inputs or both are outputs.
    pub fn bind_io(
        leader: &'a mut StreamTask,
        follower: &'a mut StreamTask,
    ) -> Result<Self, StreamError> {
        if leader.direction() == follower.direction() {
            return Err(StreamError::DirectionMismatch(leader.direction()));
        }
        Self::bind(leader, follower)
    }

    pub fn leader(&self) -> &StreamTask {
        self.leader
    }

    pub fn follower(&self) -> &StreamTask {
        self.follower
    }

    /// Arm the follower, then start the leader
    ///
    /// Order:
    /// 1. push the leader's clock and buffer settings without starting it
    /// 2. arm the follower on the leader's start edge
    /// 3. start the leader, which releases the follower
    /// 4. mark the follower running
    ///
    /// Both tasks then report the same start tick. If the leader fails to
    /// start, the armed follower is stopped again.
    pub fn start_synchronized(&mut self) -> Result<(), StreamError> {
        self.leader.prepare()?;
        self.follower.arm()?;

        if let Err(e) = self.leader.start() {
            tracing::warn!(leader = %self.leader.name(), "Leader failed to start: {}", e);
            if let Err(stop_err) = self.follower.stop() {
                tracing::warn!(
                    follower = %self.follower.name(),
                    "Failed to disarm follower: {}",
                    stop_err
                );
            }
            return Err(e);
        }
        self.follower.start()?;

        tracing::info!(
            leader = %self.leader.name(),
            follower = %self.follower.name(),
            leader_tick = ?self.leader.stats().start_tick,
            follower_tick = ?self.follower.stats().start_tick,
            "Synchronized start"
        );
        Ok(())
    }

    /// Stop the leader, then the follower
    ///
    /// Both are stopped even if the first fails; the first error is returned.
    pub fn stop_all(&mut self) -> Result<(), StreamError> {
        let leader = self.leader.stop();
        let follower = self.follower.stop();
        leader.and(follower)
    }

    /// Directions of the bound pair, leader first
    pub fn directions(&self) -> (Direction, Direction) {
        (self.leader.direction(), self.follower.direction())
    }
}

impl Drop for SyncCoordinator<'_> {
    fn drop(&mut self) {
        if self.follower.state() == TaskState::Configured {
            if let Err(e) = self.follower.set_clock_source(self.previous_source) {
                tracing::debug!(follower = %self.follower.name(), "Clock source not restored: {}", e);
            }
        }
    }
}
