//! The top-level cooperative driver: repeatedly steps a [`Node`] until the caller sets the exit
//! flag or an overall timeout elapses. Everything below this lives entirely on the calling
//! thread - the only cross-thread interaction this crate permits is the exit flag itself.

use crate::clock::Clock;
use crate::error::Result;
use crate::node::Node;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const POLL_SLICE: Duration = Duration::from_millis(100);

/// Drives `node` to completion. Each iteration advances every ready state machine by one step,
/// drains at most one queued master call, and fires due timers via [`Node::pump`]; the exit flag
/// is checked once per iteration boundary, never from inside a state-machine step, so a step is
/// always allowed to finish before the loop can return.
///
/// `overall_timeout` of `None` means run until `exit_flag` is set. The exit flag is written with
/// `Ordering::SeqCst` by the caller (typically a signal handler) and read here with
/// `Ordering::Acquire` - the spec's minimum memory-model requirement for a flag with no other
/// synchronization behind it.
pub fn start_loop(node: &mut Node, clock: &dyn Clock, overall_timeout: Option<Duration>, exit_flag: &AtomicBool) -> Result<()> {
    let deadline = overall_timeout.map(|timeout| clock.now_micros() + timeout.as_micros() as u64);

    loop {
        if exit_flag.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(deadline) = deadline {
            if clock.now_micros() >= deadline {
                return Ok(());
            }
        }

        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(clock.now_micros());
                POLL_SLICE.min(Duration::from_micros(remaining))
            }
            None => POLL_SLICE,
        };

        node.pump(Some(slice))?;

        if node.shutdown_requested() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::NodeConfig;
    use crate::logging::default_logger;
    use crate::message::StaticSchemaLoader;

    #[test]
    fn exits_promptly_once_flag_is_set() {
        let clock = SystemClock::new();
        let mut node = Node::create(NodeConfig::default(), Box::new(SystemClock::new()), default_logger(), Box::new(StaticSchemaLoader::new())).unwrap();
        let exit_flag = AtomicBool::new(true);

        let result = start_loop(&mut node, &clock, Some(Duration::from_secs(5)), &exit_flag);
        assert!(result.is_ok());
    }

    #[test]
    fn exits_once_overall_timeout_elapses() {
        let clock = SystemClock::new();
        let mut node = Node::create(NodeConfig::default(), Box::new(SystemClock::new()), default_logger(), Box::new(StaticSchemaLoader::new())).unwrap();
        let exit_flag = AtomicBool::new(false);

        let started = clock.now_micros();
        let result = start_loop(&mut node, &clock, Some(Duration::from_millis(50)), &exit_flag);
        assert!(result.is_ok());
        assert!(clock.now_micros() - started < Duration::from_secs(2).as_micros() as u64);
    }
}
