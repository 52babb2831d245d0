use std::io;

use thiserror::Error;

/// An error returned by [`TaskGroup::go`][crate::TaskGroup::go] when a work unit could not be
/// scheduled.
///
/// Failures of the work units themselves are never reported through this type. They are returned
/// by [`TaskGroup::wait`][crate::TaskGroup::wait] and broadcast to subscribers unchanged.
#[derive(Debug, Error)]
pub enum GroupError {
    /// The OS refused to spawn a thread for the work unit.
    #[error("failed to spawn task thread")]
    Spawn(#[from] io::Error),

    /// The group has already started draining, so no more work can be added to it.
    #[error("task group has already been drained")]
    Drained,
}
