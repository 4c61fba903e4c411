//! Connectivity states and the rule for aggregating them.

use std::fmt;

/// The connectivity state of a subchannel or load balancer.
///
/// See: <https://github.com/grpc/grpc/blob/master/doc/connectivity-semantics-and-api.md>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// Not connected and not attempting to connect.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// A connection is established and streams can be created.
    Ready,
    /// The most recent connection attempt failed; waiting out a backoff
    /// period before trying again.
    TransientFailure,
    /// Terminal. No connection exists and none will be attempted.
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Ready => "ready",
            ConnectivityState::TransientFailure => "transient-failure",
            ConnectivityState::Shutdown => "shutdown",
        };
        write!(f, "{name}")
    }
}

/// Aggregate the connectivity states of a set of subchannels into the state
/// reported by the load balancer owning them.
///
/// The rule, applied in order:
/// - any `Ready` => `Ready`
/// - else any `Connecting` => `Connecting`
/// - else any `Idle` => `Idle`
/// - else all `TransientFailure` => `TransientFailure`
/// - else => `Shutdown`
///
/// An empty set aggregates to `Shutdown`.
pub fn aggregate<I>(states: I) -> ConnectivityState
where
    I: IntoIterator<Item = ConnectivityState>,
{
    let mut total = 0usize;
    let mut transient_failures = 0usize;
    let mut seen_idle = false;
    let mut seen_connecting = false;

    for state in states {
        total += 1;
        match state {
            ConnectivityState::Ready => return ConnectivityState::Ready,
            ConnectivityState::Connecting => seen_connecting = true,
            ConnectivityState::Idle => seen_idle = true,
            ConnectivityState::TransientFailure => transient_failures += 1,
            ConnectivityState::Shutdown => {}
        }
    }

    if seen_connecting {
        ConnectivityState::Connecting
    } else if seen_idle {
        ConnectivityState::Idle
    } else if total > 0 && transient_failures == total {
        ConnectivityState::TransientFailure
    } else {
        ConnectivityState::Shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectivityState::*;

    #[test]
    fn any_ready_wins() {
        assert_eq!(aggregate([Ready, Connecting, Idle]), Ready);
        assert_eq!(aggregate([TransientFailure, Ready]), Ready);
    }

    #[test]
    fn connecting_beats_idle() {
        assert_eq!(aggregate([Idle, Connecting, Idle]), Connecting);
        assert_eq!(aggregate([Connecting, TransientFailure]), Connecting);
    }

    #[test]
    fn idle_beats_transient_failure() {
        assert_eq!(aggregate([Idle, TransientFailure]), Idle);
    }

    #[test]
    fn all_transient_failure() {
        assert_eq!(
            aggregate([TransientFailure, TransientFailure]),
            TransientFailure
        );
        // A mix of transient failure and shutdown is not "all".
        assert_eq!(aggregate([TransientFailure, Shutdown]), Shutdown);
    }

    #[test]
    fn empty_set_is_shutdown() {
        assert_eq!(aggregate([]), Shutdown);
    }
}
