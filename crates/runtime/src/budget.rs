use super::*;

impl AgentRuntime {
    pub(crate) fn validate_guard_preconditions(&self) -> Result<(), RuntimeError> {
        validate_limits(&self.limits)
    }
}

pub(crate) fn validate_limits(limits: &RuntimeLimits) -> Result<(), RuntimeError> {
    let invalid = if limits.max_iterations == 0 {
        Some("max_iterations")
    } else if limits.turn_timeout.is_zero() {
        Some("turn_timeout")
    } else if limits.tool_timeout.is_zero() {
        Some("tool_timeout")
    } else if limits.stream_buffer_size == 0 {
        Some("stream_buffer_size")
    } else if limits.dispatch_queue_capacity == 0 {
        Some("dispatch_queue_capacity")
    } else {
        None
    };
    match invalid {
        Some(field) => Err(RuntimeError::InvalidLimit { field }),
        None => Ok(()),
    }
}
