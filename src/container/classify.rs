//! Classification of raw host failures.
//!
//! The daemon reports most conditions only as free text. All of the matching
//! lives here so each operation can branch on a [`HostErrorKind`] instead of
//! on substrings.

use crate::container::HostError;

/// What a host failure means to the lifecycle code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    /// Container or image does not exist
    NotFound,
    /// Kill target is not running
    NotRunning,
    /// Pause target is already paused
    AlreadyPaused,
    /// Unpause target is not paused
    NotPaused,
    /// A requested host port is already bound
    PortAllocated,
    /// The daemon socket refused the current user
    PermissionDenied,
    /// Anything else
    Other,
}

const NOT_FOUND_PATTERNS: &[&str] = &["No such container", "No such image"];
const PORT_ALLOCATED_PATTERNS: &[&str] = &["port is already allocated", "address already in use"];

/// Classify a host failure.
pub fn classify(err: &HostError) -> HostErrorKind {
    let msg = err.message.as_str();

    if err.status == Some(404) || NOT_FOUND_PATTERNS.iter().any(|p| msg.contains(p)) {
        return HostErrorKind::NotFound;
    }
    if msg.contains("is already paused") {
        return HostErrorKind::AlreadyPaused;
    }
    if msg.contains("is not paused") {
        return HostErrorKind::NotPaused;
    }
    if msg.contains("is not running") {
        return HostErrorKind::NotRunning;
    }
    if PORT_ALLOCATED_PATTERNS.iter().any(|p| msg.contains(p)) {
        return HostErrorKind::PortAllocated;
    }
    if msg.to_lowercase().contains("permission denied") {
        return HostErrorKind::PermissionDenied;
    }
    HostErrorKind::Other
}

/// What a kill failure means for a destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// Container is already stopped; continue with the removal
    ProceedToRemove,
    /// Container is gone; the destroy is already complete
    AlreadyRemoved,
    Fatal,
}

/// What a pause or unpause failure means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Target is already in the requested state
    AlreadyDone,
    NotFound,
    Fatal,
}

pub fn kill_outcome(err: &HostError) -> KillOutcome {
    match classify(err) {
        HostErrorKind::NotRunning => KillOutcome::ProceedToRemove,
        HostErrorKind::NotFound => KillOutcome::AlreadyRemoved,
        _ => KillOutcome::Fatal,
    }
}

pub fn pause_outcome(err: &HostError) -> ToggleOutcome {
    match classify(err) {
        HostErrorKind::AlreadyPaused => ToggleOutcome::AlreadyDone,
        HostErrorKind::NotFound => ToggleOutcome::NotFound,
        _ => ToggleOutcome::Fatal,
    }
}

pub fn unpause_outcome(err: &HostError) -> ToggleOutcome {
    match classify(err) {
        HostErrorKind::NotPaused => ToggleOutcome::AlreadyDone,
        HostErrorKind::NotFound => ToggleOutcome::NotFound,
        _ => ToggleOutcome::Fatal,
    }
}
