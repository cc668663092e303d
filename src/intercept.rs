//! Intercept points: breakpoints at function entries whose hits run host callbacks.
//!
//! While a callback runs the target stays halted at the function entry, and the callback may use
//! the full session: evaluate, read and write memory, call target functions, install or delete
//! intercepts. Hits caused by those nested operations are handled as well, innermost first.
//! When the callback returns the target either continues into the function or returns from it
//! immediately with a value the callback chose.

use std::fmt;
use std::rc::Rc;

use log::{debug, info, trace, warn};

use crate::calling_convention::{ArgumentShape, CallingConvention, Placement, TargetAccess};
use crate::error::{Error, Result};
use crate::evaluate::marshal::{check, decode, encode, host_layout};
use crate::evaluate::{TargetPtr, Value};
use crate::mi::{Command, Event, ListenerId};
use crate::registers::CoreRegister;
use crate::symbols::{FunctionSignature, ScalarEncoding, TypeDescriptor};
use crate::target::TargetSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterceptId(u32);

impl fmt::Display for InterceptId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptState {
    /// Waiting for a hit.
    Armed,
    /// Callbacks are running, `depth` of them for recursive hits.
    Triggered { depth: usize },
    /// The breakpoint is removed, the point only keeps its hit count.
    Deleted,
}

/// Code run when the target reaches an intercept point.
pub trait InterceptHandler {
    fn on_hit(&self, context: &mut InterceptContext) -> Result<()>;
}

impl<F> InterceptHandler for F
where
    F: Fn(&mut InterceptContext) -> Result<()>,
{
    fn on_hit(&self, context: &mut InterceptContext) -> Result<()> {
        self(context)
    }
}

struct InterceptPoint {
    id: InterceptId,
    location: String,
    address: u32,
    breakpoint: u32,
    listener: ListenerId,
    state: InterceptState,
    /// Deleted during a callback, removed once the target resumes.
    delete_pending: bool,
    breakpoint_removed: bool,
    hits: u64,
    handler: Rc<dyn InterceptHandler>,
    signature: Option<Rc<FunctionSignature>>,
}

/// A snapshot of an intercept point.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptInfo {
    pub id: InterceptId,
    pub location: String,
    pub address: u32,
    pub breakpoint: u32,
    pub state: InterceptState,
    pub hits: u64,
}

#[derive(Default)]
pub(crate) struct InterceptRegistry {
    points: Vec<InterceptPoint>,
    next_id: u32,
}

impl InterceptRegistry {
    fn get(&self, id: InterceptId) -> Option<&InterceptPoint> {
        self.points.iter().find(|p| p.id == id)
    }

    fn get_mut(&mut self, id: InterceptId) -> Option<&mut InterceptPoint> {
        self.points.iter_mut().find(|p| p.id == id)
    }

    fn at(&self, address: u32) -> Option<&InterceptPoint> {
        self.points
            .iter()
            .find(|p| p.address == address && p.state != InterceptState::Deleted)
    }

    pub(crate) fn owns_breakpoint(&self, number: u32) -> bool {
        self.points
            .iter()
            .any(|p| p.breakpoint == number && !p.breakpoint_removed)
    }

    /// The intercept of the most recently registered matching listener.
    pub(crate) fn by_listeners(&self, listeners: &[ListenerId]) -> Option<InterceptId> {
        listeners.iter().find_map(|listener| {
            self.points
                .iter()
                .find(|p| p.listener == *listener && p.state != InterceptState::Deleted)
                .map(|p| p.id)
        })
    }

    /// True if an intercept that is not deleted sits at `address`.
    pub(crate) fn is_armed_at(&self, address: u32) -> bool {
        self.at(address).is_some()
    }

    /// The breakpoint and listener of the intercept armed at `address`.
    pub(crate) fn breakpoint_at(&self, address: u32) -> Option<(u32, ListenerId)> {
        self.points
            .iter()
            .find(|p| p.address == address && !p.breakpoint_removed)
            .map(|p| (p.breakpoint, p.listener))
    }
}

/// What happens when a callback returns.
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    /// Execute the function.
    Continue,
    /// Return to the caller at once, with the encoded result if the function has one.
    Return(Option<Vec<u8>>),
}

/// The view of a callback onto the halted target.
pub struct InterceptContext<'a> {
    session: &'a mut TargetSession,
    id: InterceptId,
    location: String,
    address: u32,
    hits: u64,
    signature: Option<Rc<FunctionSignature>>,
    decision: Decision,
    delete: bool,
}

impl<'a> InterceptContext<'a> {
    pub fn id(&self) -> InterceptId {
        self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// The function entry the target is halted at.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Hits of this intercept so far, the current one included.
    pub fn hit_count(&self) -> u64 {
        self.hits
    }

    pub fn signature(&self) -> Option<&FunctionSignature> {
        self.signature.as_deref()
    }

    /// The whole session, to evaluate, call or manage other intercepts.
    pub fn session(&mut self) -> &mut TargetSession {
        self.session
    }

    pub fn evaluate(&mut self, expression: &str) -> Result<Value> {
        self.session.evaluate(expression)
    }

    pub fn call(&mut self, function: &str, arguments: &[Value]) -> Result<Value> {
        self.session.call(function, arguments)
    }

    pub fn read_memory(&mut self, address: u32, length: u32) -> Result<Vec<u8>> {
        self.session.read_memory(address, length)
    }

    pub fn write_memory(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        self.session.write_memory(address, bytes)
    }

    /// The raw word of argument `index`, e.g. a pointer.
    pub fn argument(&mut self, index: usize) -> Result<u32> {
        let bytes = self.argument_bytes(index)?;
        let mut word = [0; 4];
        for (dst, src) in word.iter_mut().zip(bytes.iter()) {
            *dst = *src;
        }
        Ok(u32::from_le_bytes(word))
    }

    /// Argument `index` decoded with its declared type, or as a word if the type is unknown.
    pub fn argument_value(&mut self, index: usize) -> Result<Value> {
        match self.parameter_type(index) {
            Some(ty) => {
                let bytes = self.argument_bytes(index)?;
                decode(&ty, &bytes)
            }
            None => Ok(Value::Unsigned(u64::from(self.argument(index)?))),
        }
    }

    /// An argument by its parameter name, falls back to evaluating the name.
    pub fn named_argument(&mut self, name: &str) -> Result<Value> {
        let index = self.signature.as_ref().and_then(|signature| {
            signature
                .parameters
                .iter()
                .position(|p| p.name.as_deref() == Some(name))
        });
        match index {
            Some(index) => self.argument_value(index),
            None => self.session.evaluate(name),
        }
    }

    /// Replaces argument `index` before the function sees it.
    pub fn set_argument<V: Into<Value>>(&mut self, index: usize, value: V) -> Result<()> {
        let value = value.into();
        let bytes = match self.parameter_type(index) {
            Some(ty) => {
                check(&ty, &value)?;
                let memory = &mut self.session.memory;
                let mut pending = vec![];
                let mut place = |bytes: &[u8], alignment: u32| -> Result<u32> {
                    let address =
                        memory.alloc(bytes.len() as u32, TargetSession::scratch_alignment(alignment))?;
                    pending.push((address, bytes.to_vec()));
                    Ok(address)
                };
                let encoded = encode(&ty, &value, &mut place)?;
                for (address, data) in pending {
                    self.session.write_memory(address, &data)?;
                }
                encoded
            }
            None => match value {
                Value::Unsigned(_) | Value::Signed(_) | Value::Bool(_) | Value::Pointer(_) => {
                    host_layout(&value)?.0
                }
                other => {
                    return Err(Error::ArgumentType(format!(
                        "a {} needs the signature of `{}`",
                        other.get_type(),
                        self.location
                    )))
                }
            },
        };
        let placement = self.placement(index);
        let slot = placement
            .arguments
            .get(index)
            .ok_or_else(|| Error::ArgumentType(format!("no argument {}", index)))?;
        let convention = self.session.convention;
        convention.write_argument(self.session, slot, &bytes)?;
        trace!("Argument {} of `{}` replaced by {}", index, self.location, value);
        Ok(())
    }

    /// Returns from the function at once, without executing it.
    ///
    /// Only possible while the target is still at the function entry.
    pub fn force_return<V: Into<Value>>(&mut self, value: V) -> Result<()> {
        let value = value.into();
        let pc = self.session.read_core_register(CoreRegister::Pc)?;
        if pc != self.address {
            return Err(Error::InterceptTooLate {
                address: self.address,
                pc,
            });
        }
        let return_type = self.signature.as_ref().and_then(|s| s.return_type.clone());
        let bytes = match (return_type, &value) {
            (_, Value::Void) => None,
            (None, Value::Unsigned(_)) | (None, Value::Signed(_)) | (None, Value::Pointer(_)) => {
                Some(host_layout(&value)?.0)
            }
            (Some(ty), _) => {
                check(&ty, &value)?;
                let mut no_scratch = |_: &[u8], _: u32| -> Result<u32> {
                    Err(Error::ArgumentType(
                        "return values cannot reference scratch memory".to_string(),
                    ))
                };
                Some(encode(&ty, &value, &mut no_scratch)?)
            }
            (None, other) => {
                return Err(Error::ArgumentType(format!(
                    "a {} needs the signature of `{}`",
                    other.get_type(),
                    self.location
                )))
            }
        };
        self.decision = Decision::Return(bytes);
        Ok(())
    }

    /// Lets the function execute, undoing an earlier `force_return`.
    pub fn resume(&mut self) {
        self.decision = Decision::Continue;
    }

    /// Removes this intercept once the target resumes.
    pub fn delete(&mut self) {
        self.delete = true;
    }

    fn parameter_type(&self, index: usize) -> Option<Rc<TypeDescriptor>> {
        self.signature
            .as_ref()
            .and_then(|s| s.parameters.get(index))
            .map(|p| p.ty.clone())
    }

    fn placement(&self, index: usize) -> Placement {
        let convention = self.session.convention;
        match &self.signature {
            Some(signature) if index < signature.parameters.len() => {
                let shapes: Vec<ArgumentShape> = signature
                    .parameters
                    .iter()
                    .map(|p| ArgumentShape::of(&p.ty))
                    .collect();
                convention.place(signature.return_type.as_deref(), &shapes)
            }
            _ => {
                let words = vec![ArgumentShape::word(); index + 1];
                convention.place(None, &words)
            }
        }
    }

    fn argument_bytes(&mut self, index: usize) -> Result<Vec<u8>> {
        let placement = self.placement(index);
        let slot = placement
            .arguments
            .get(index)
            .ok_or_else(|| Error::ArgumentType(format!("no argument {}", index)))?;
        let convention = self.session.convention;
        convention.read_argument(self.session, slot)
    }
}

impl TargetSession {
    /// Installs an intercept point at the entry of `location`.
    ///
    /// Description:
    ///
    /// * `location` - A function name or an address.
    /// * `handler` - Runs on every hit, while the target is halted.
    ///
    /// Fails without touching the target if the location is unknown, already intercepted, or
    /// carries a breakpoint the engine does not own.
    pub fn install_intercept<H>(&mut self, location: &str, handler: H) -> Result<InterceptId>
    where
        H: InterceptHandler + 'static,
    {
        self.require_halted()?;
        let symbol = self.resolve(location)?;
        let address = symbol.address & !1;

        if let Some(existing) = self.intercepts.at(address) {
            debug!("`{}` is already intercepted by {}", location, existing.id);
            return Err(Error::DuplicateIntercept(address));
        }
        if self.halt_points.is_installed_at(address) {
            debug!("`{}` already carries a halt point", location);
            return Err(Error::DuplicateIntercept(address));
        }
        self.check_breakpoint_conflict(address)?;

        let signature = if location.starts_with('*') || location.starts_with("0x") {
            None
        } else {
            match self.signature(location) {
                Ok(signature) => Some(signature),
                Err(err) if !err.is_fatal() => {
                    debug!("No signature for `{}`: {}", location, err);
                    None
                }
                Err(err) => return Err(err),
            }
        };

        let breakpoint = self.insert_breakpoint(address, false, false)?;
        let listener = self
            .transport
            .subscribe(move |event| event.is_breakpoint_hit() && event.frame_address() == Some(address));

        self.intercepts.next_id += 1;
        let id = InterceptId(self.intercepts.next_id);
        self.intercepts.points.push(InterceptPoint {
            id,
            location: location.to_string(),
            address,
            breakpoint,
            listener,
            state: InterceptState::Armed,
            delete_pending: false,
            breakpoint_removed: false,
            hits: 0,
            handler: Rc::new(handler),
            signature,
        });
        info!("Intercept {} armed at `{}` ({:#010x})", id, location, address);
        Ok(id)
    }

    /// Removes an intercept point. The target must be halted.
    ///
    /// An intercept whose callback is running is removed once the target resumes. Deleting a
    /// deleted intercept does nothing.
    pub fn delete_intercept(&mut self, id: InterceptId) -> Result<()> {
        let state = self
            .intercepts
            .get(id)
            .map(|p| p.state)
            .ok_or(Error::UnknownIntercept(id))?;
        match state {
            InterceptState::Deleted => Ok(()),
            InterceptState::Triggered { .. } => {
                debug!("Intercept {} is triggered, deleting it on resume", id);
                if let Some(point) = self.intercepts.get_mut(id) {
                    point.delete_pending = true;
                }
                Ok(())
            }
            InterceptState::Armed => {
                self.require_halted()?;
                if let Some(breakpoint) = self.intercepts.get(id).map(|p| p.breakpoint) {
                    self.execute(Command::DeleteBreakpoint(breakpoint))?;
                }
                self.finalize_intercept(id);
                Ok(())
            }
        }
    }

    /// How often the intercept was hit, also after it was deleted.
    pub fn intercept_hits(&self, id: InterceptId) -> Option<u64> {
        self.intercepts.get(id).map(|p| p.hits)
    }

    pub fn intercept_state(&self, id: InterceptId) -> Option<InterceptState> {
        self.intercepts.get(id).map(|p| p.state)
    }

    /// The intercepts that are not deleted.
    pub fn intercepts(&self) -> Vec<InterceptInfo> {
        self.intercepts
            .points
            .iter()
            .filter(|p| p.state != InterceptState::Deleted)
            .map(|p| InterceptInfo {
                id: p.id,
                location: p.location.clone(),
                address: p.address,
                breakpoint: p.breakpoint,
                state: p.state,
                hits: p.hits,
            })
            .collect()
    }

    /// Removes every intercept, deleted ones included.
    pub(crate) fn delete_all_intercepts(&mut self) -> Result<()> {
        let ids: Vec<InterceptId> = self.intercepts.points.iter().map(|p| p.id).collect();
        let mut result = Ok(());
        for id in ids {
            if let Some(point) = self.intercepts.get_mut(id) {
                if !point.breakpoint_removed {
                    point.breakpoint_removed = true;
                    let breakpoint = point.breakpoint;
                    if let Err(err) = self.execute(Command::DeleteBreakpoint(breakpoint)) {
                        if err.is_fatal() {
                            return Err(err);
                        }
                        result = Err(err);
                    }
                }
            }
            self.finalize_intercept(id);
        }
        self.intercepts.points.clear();
        result
    }

    fn finalize_intercept(&mut self, id: InterceptId) {
        let listener = match self.intercepts.get_mut(id) {
            Some(point) if point.state != InterceptState::Deleted => {
                point.state = InterceptState::Deleted;
                point.breakpoint_removed = true;
                point.delete_pending = false;
                info!(
                    "Intercept {} at `{}` deleted after {} hits",
                    id, point.location, point.hits
                );
                point.listener
            }
            _ => return,
        };
        self.transport.unsubscribe(listener);
    }

    /// Fails if a breakpoint the engine does not own sits at `address`.
    pub(crate) fn check_breakpoint_conflict(&mut self, address: u32) -> Result<()> {
        let record = self.execute(Command::ListBreakpoints)?;
        let body = match record
            .results
            .get_tuple("BreakpointTable")
            .and_then(|table| table.get_list("body"))
        {
            Some(body) => body,
            None => return Ok(()),
        };
        let trampoline = self.memory.trampoline.map(|t| t.breakpoint);
        for entry in body.values() {
            let breakpoint = match entry.as_tuple() {
                Some(breakpoint) => breakpoint,
                None => continue,
            };
            let number = match breakpoint.get_u64("number") {
                Some(number) => number as u32,
                None => continue,
            };
            if Some(number) == trampoline
                || self.intercepts.owns_breakpoint(number)
                || self.halt_points.owns_breakpoint(number)
            {
                continue;
            }
            if breakpoint.get_u64("addr").map(|a| a as u32 & !1) == Some(address) {
                return Err(Error::ConflictingBreakpoint { number, address });
            }
        }
        Ok(())
    }

    /// Runs the callback of an intercept that was hit and resumes the target.
    pub(crate) fn dispatch_intercept(&mut self, id: InterceptId, event: &Event) -> Result<()> {
        let (handler, location, address, signature, hits, depth) = match self.intercepts.get_mut(id)
        {
            Some(point) if point.state != InterceptState::Deleted => {
                point.hits += 1;
                let depth = match point.state {
                    InterceptState::Triggered { depth } => depth + 1,
                    _ => 1,
                };
                point.state = InterceptState::Triggered { depth };
                (
                    point.handler.clone(),
                    point.location.clone(),
                    point.address,
                    point.signature.clone(),
                    point.hits,
                    depth,
                )
            }
            _ => {
                warn!("Hit of unknown intercept {}: {}", id, event.describe());
                return Ok(());
            }
        };
        debug!("Intercept `{}` hit, {} times so far", location, hits);

        let (outcome, decision, delete) = match self.enter() {
            Ok(()) => {
                let mut context = InterceptContext {
                    session: self,
                    id,
                    location: location.clone(),
                    address,
                    hits,
                    signature: signature.clone(),
                    decision: Decision::Continue,
                    delete: false,
                };
                let outcome = handler.on_hit(&mut context);
                let decision = context.decision;
                let delete = context.delete;
                self.leave();
                (outcome, decision, delete)
            }
            Err(err) => (Err(err), Decision::Continue, false),
        };

        if delete {
            if let Some(point) = self.intercepts.get_mut(id) {
                point.delete_pending = true;
            }
        }
        if let Err(err) = outcome {
            warn!("Intercept callback at `{}` failed: {}", location, err);
            self.callback_errors.push(Error::InterceptCallback {
                location: location.clone(),
                source: Box::new(err),
            });
        }

        let resumed = self.resume_intercept(id, address, signature.as_deref(), decision);

        let finished = match self.intercepts.get_mut(id) {
            Some(point) if point.state != InterceptState::Deleted => {
                point.state = if depth > 1 {
                    InterceptState::Triggered { depth: depth - 1 }
                } else {
                    InterceptState::Armed
                };
                depth == 1 && point.delete_pending
            }
            _ => false,
        };
        if finished {
            self.finalize_intercept(id);
        }
        resumed
    }

    fn resume_intercept(
        &mut self,
        id: InterceptId,
        address: u32,
        signature: Option<&FunctionSignature>,
        decision: Decision,
    ) -> Result<()> {
        let (breakpoint, present) = match self.intercepts.get_mut(id) {
            Some(point) => {
                if point.delete_pending && !point.breakpoint_removed {
                    point.breakpoint_removed = true;
                    let breakpoint = point.breakpoint;
                    self.execute(Command::DeleteBreakpoint(breakpoint))?;
                    (breakpoint, false)
                } else {
                    (point.breakpoint, !point.breakpoint_removed)
                }
            }
            None => return self.resume(),
        };

        match decision {
            Decision::Return(bytes) => {
                let pc = self.read_core_register(CoreRegister::Pc)?;
                if pc != address {
                    warn!(
                        "Target moved to {:#010x} during the callback, not returning from {:#010x}",
                        pc, address
                    );
                    return self.resume();
                }
                let return_type = match (&bytes, signature) {
                    (Some(_), Some(signature)) => signature.return_type.clone(),
                    _ => None,
                };
                let convention = self.convention;
                let to = match (return_type, bytes) {
                    (Some(ty), Some(bytes)) => convention.force_return(self, Some(&ty), &bytes)?,
                    (None, Some(bytes)) => {
                        let word = TypeDescriptor::scalar(
                            "uint32_t",
                            bytes.len() as u64,
                            ScalarEncoding::Unsigned,
                        );
                        convention.force_return(self, Some(&word), &bytes)?
                    }
                    (_, None) => convention.force_return(self, None, &[])?,
                };
                debug!("Returning from {:#010x} to {}", address, TargetPtr(to));
                self.resume()
            }
            Decision::Continue => {
                if present && self.read_core_register(CoreRegister::Pc)? == address {
                    self.step_over(breakpoint)?;
                }
                self.resume()
            }
        }
    }
}
