//! Per-connection trace events
//!
//! All events carry the connection id as a structured field so one
//! connection can be followed across the loop thread and its handler.

use kuv_core::{ConnectionId, UvError};
use tracing::{debug, info, trace};

#[inline]
pub(crate) fn connection_read(id: &ConnectionId, count: usize) {
    trace!(target: "kuv::connection", connection_id = %id, count, "read");
}

#[inline]
pub(crate) fn connection_write(id: &ConnectionId, count: usize) {
    trace!(target: "kuv::connection", connection_id = %id, count, "write");
}

pub(crate) fn connection_pause(id: &ConnectionId) {
    debug!(target: "kuv::connection", connection_id = %id, "paused");
}

pub(crate) fn connection_resume(id: &ConnectionId) {
    debug!(target: "kuv::connection", connection_id = %id, "resumed");
}

pub(crate) fn connection_read_fin(id: &ConnectionId) {
    debug!(target: "kuv::connection", connection_id = %id, "received FIN");
}

pub(crate) fn connection_write_fin(id: &ConnectionId, reason: &str) {
    debug!(target: "kuv::connection", connection_id = %id, reason, "sending FIN");
}

pub(crate) fn connection_reset(id: &ConnectionId) {
    debug!(target: "kuv::connection", connection_id = %id, "reset");
}

pub(crate) fn connection_error(id: &ConnectionId, error: &UvError) {
    info!(target: "kuv::connection", connection_id = %id, %error, "communication error");
}

pub(crate) fn connection_closed(id: &ConnectionId, result: &Result<(), UvError>) {
    match result {
        Ok(()) => debug!(target: "kuv::connection", connection_id = %id, "closed"),
        Err(error) => debug!(target: "kuv::connection", connection_id = %id, %error, "closed with error"),
    }
}
