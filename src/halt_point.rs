//! Halt points: plain breakpoints a test waits for.
//!
//! A halt point leaves the target halted when it is reached, the test continues once
//! `wait_halt_point` returns. A barrier resumes the target right away, waiting on it only tells
//! the test that the location was passed.

use std::fmt;
use std::time::Duration;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::mi::{Command, Deadline, ListenerId};
use crate::target::{TargetSession, TargetState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HaltPointId(u32);

impl fmt::Display for HaltPointId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct HaltPoint {
    id: HaltPointId,
    location: String,
    address: u32,
    breakpoint: u32,
    listener: ListenerId,
    barrier: bool,
    temporary: bool,
    /// A temporary breakpoint is gone after its first hit.
    breakpoint_removed: bool,
    hits: u64,
    /// Hits nobody waited for yet.
    pending: u64,
}

/// A snapshot of a halt point.
#[derive(Debug, Clone, PartialEq)]
pub struct HaltPointInfo {
    pub id: HaltPointId,
    pub location: String,
    pub address: u32,
    pub breakpoint: u32,
    pub barrier: bool,
    pub temporary: bool,
    pub hits: u64,
}

#[derive(Default)]
pub(crate) struct HaltPointRegistry {
    points: Vec<HaltPoint>,
    next_id: u32,
}

impl HaltPointRegistry {
    fn get(&self, id: HaltPointId) -> Option<&HaltPoint> {
        self.points.iter().find(|p| p.id == id)
    }

    pub(crate) fn is_installed_at(&self, address: u32) -> bool {
        self.points
            .iter()
            .any(|p| p.address == address && !p.breakpoint_removed)
    }

    pub(crate) fn owns_breakpoint(&self, number: u32) -> bool {
        self.points
            .iter()
            .any(|p| p.breakpoint == number && !p.breakpoint_removed)
    }

    pub(crate) fn breakpoint_at(&self, address: u32) -> Option<u32> {
        self.points
            .iter()
            .find(|p| p.address == address && !p.breakpoint_removed)
            .map(|p| p.breakpoint)
    }

    /// Counts a stop matched by one of `listeners`.
    ///
    /// Returns whether the halt point hit is a barrier, `None` if no halt point matched.
    pub(crate) fn record_hit(&mut self, listeners: &[ListenerId]) -> Option<bool> {
        let point = self
            .points
            .iter_mut()
            .find(|p| listeners.contains(&p.listener))?;
        point.hits += 1;
        point.pending += 1;
        if point.temporary {
            point.breakpoint_removed = true;
        }
        debug!(
            "Halt point {} at `{}` reached, {} times so far",
            point.id, point.location, point.hits
        );
        Some(point.barrier)
    }
}

impl TargetSession {
    /// Installs a halt point: the target stays halted when it reaches `location`.
    ///
    /// Description:
    ///
    /// * `location` - A function name or an address.
    /// * `temporary` - The debugger removes the breakpoint when it is first hit.
    pub fn install_halt_point(&mut self, location: &str, temporary: bool) -> Result<HaltPointId> {
        self.add_halt_point(location, temporary, false)
    }

    /// Installs a barrier: reaching `location` is counted and the target continues at once.
    pub fn install_barrier(&mut self, location: &str) -> Result<HaltPointId> {
        self.add_halt_point(location, false, true)
    }

    /// Waits until the target reached the halt point, returns its address.
    ///
    /// Hits that happened before are consumed one per wait, so a hit is never missed. Fails if
    /// the target is halted with no hit pending, or stops anywhere else.
    pub fn wait_halt_point(&mut self, id: HaltPointId, timeout: Duration) -> Result<u32> {
        let errors = self.callback_errors.len();
        let deadline = Deadline::after(timeout);
        loop {
            let point = self
                .halt_points
                .points
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or(Error::UnknownHaltPoint(id))?;
            if point.pending > 0 {
                point.pending -= 1;
                let address = point.address;
                self.take_callback_error(errors)?;
                return Ok(address);
            }
            let listener = point.listener;
            if self.state != TargetState::Running {
                return Err(Error::TargetState(self.state));
            }

            let delivery = self.next_delivery(&deadline)?;
            if self.observe(&delivery)? {
                continue;
            }
            if let Some(intercept) = self.intercepts.by_listeners(&delivery.listeners) {
                self.dispatch_intercept(intercept, &delivery.event)?;
                continue;
            }
            if delivery.event.is_stopped() && !delivery.listeners.contains(&listener) {
                return Err(Error::UnexpectedStop {
                    pc: delivery.event.frame_address().unwrap_or(0),
                    reason: delivery.event.describe(),
                });
            }
        }
    }

    /// How often the halt point was reached.
    pub fn halt_point_hits(&self, id: HaltPointId) -> Option<u64> {
        self.halt_points.get(id).map(|p| p.hits)
    }

    pub fn halt_points(&self) -> Vec<HaltPointInfo> {
        self.halt_points
            .points
            .iter()
            .map(|p| HaltPointInfo {
                id: p.id,
                location: p.location.clone(),
                address: p.address,
                breakpoint: p.breakpoint,
                barrier: p.barrier,
                temporary: p.temporary,
                hits: p.hits,
            })
            .collect()
    }

    /// Removes a halt point. The target must be halted.
    pub fn delete_halt_point(&mut self, id: HaltPointId) -> Result<()> {
        let (breakpoint, removed) = self
            .halt_points
            .get(id)
            .map(|p| (p.breakpoint, p.breakpoint_removed))
            .ok_or(Error::UnknownHaltPoint(id))?;
        self.require_halted()?;
        if !removed {
            self.execute(Command::DeleteBreakpoint(breakpoint))?;
        }
        self.forget_halt_point(id);
        Ok(())
    }

    pub(crate) fn delete_all_halt_points(&mut self) -> Result<()> {
        let points: Vec<(HaltPointId, u32, bool)> = self
            .halt_points
            .points
            .iter()
            .map(|p| (p.id, p.breakpoint, p.breakpoint_removed))
            .collect();
        let mut result = Ok(());
        for (id, breakpoint, removed) in points {
            if !removed {
                if let Err(err) = self.execute(Command::DeleteBreakpoint(breakpoint)) {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    result = Err(err);
                }
            }
            self.forget_halt_point(id);
        }
        result
    }

    fn add_halt_point(&mut self, location: &str, temporary: bool, barrier: bool) -> Result<HaltPointId> {
        self.require_halted()?;
        let address = self.resolve(location)?.address & !1;
        if self.halt_points.is_installed_at(address) || self.intercepts.is_armed_at(address) {
            return Err(Error::DuplicateIntercept(address));
        }
        self.check_breakpoint_conflict(address)?;

        let breakpoint = self.insert_breakpoint(address, false, temporary)?;
        let listener = self
            .transport
            .subscribe(move |event| event.is_breakpoint_hit() && event.frame_address() == Some(address));

        self.halt_points.next_id += 1;
        let id = HaltPointId(self.halt_points.next_id);
        self.halt_points.points.push(HaltPoint {
            id,
            location: location.to_string(),
            address,
            breakpoint,
            listener,
            barrier,
            temporary,
            breakpoint_removed: false,
            hits: 0,
            pending: 0,
        });
        info!(
            "{} {} at `{}` ({:#010x})",
            if barrier { "Barrier" } else { "Halt point" },
            id,
            location,
            address
        );
        Ok(id)
    }

    fn forget_halt_point(&mut self, id: HaltPointId) {
        if let Some(index) = self.halt_points.points.iter().position(|p| p.id == id) {
            let point = self.halt_points.points.remove(index);
            self.transport.unsubscribe(point.listener);
            debug!(
                "Halt point {} at `{}` deleted after {} hits",
                id, point.location, point.hits
            );
        }
    }
}
