//! Call Context and Request Ids
//!
//! Every CALL and RESPONSE carries a [`CallContext`]: the correlation id for
//! the whole causal tree, the ordered chain of services visited, the call
//! depth, and the absolute deadline set once at the origin.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::error::{Result, RpcError};

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

const ID_SUFFIX_LEN: usize = 6;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generates an id of the form `"{prefix}-{ms-since-epoch}-{6-char base36}"`.
///
/// Uniqueness per process is sufficient; ids are opaque to the router.
fn generate_id(prefix: &str) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{}-{}", prefix, now_millis(), suffix)
}

/// A fresh id for a CALL.
pub fn generate_request_id() -> String {
    generate_id("req")
}

/// A fresh correlation id for the root of a call chain.
pub fn generate_root_id() -> String {
    generate_id("root")
}

/// The distributed call context propagated with every CALL and RESPONSE.
///
/// # Invariants
///
/// - `deadline` is copied unchanged across every extension and every network
///   hop; only the origin sets it. A deep chain can finish only if every
///   link's work fits before that absolute time.
/// - `depth` equals `chain.len()` at construction and never decreases along
///   a causal path.
/// - `root` identifies the entire causal tree and is set exactly once.
///
/// # Example
///
/// ```
/// use hubrpc_common::protocol::CallContext;
///
/// let ctx = CallContext::new("api", 30_000);
/// assert_eq!(ctx.chain, vec!["api".to_string()]);
/// assert_eq!(ctx.depth, 1);
///
/// let extended = ctx.extend("billing");
/// assert_eq!(extended.chain, vec!["api".to_string(), "billing".to_string()]);
/// assert_eq!(extended.depth, 2);
/// assert_eq!(extended.deadline, ctx.deadline);
/// assert_eq!(extended.root, ctx.root);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallContext {
    /// Correlation id for the entire causal tree, set once at the origin.
    pub root: String,
    /// Ordered sequence of service names visited, origin first.
    pub chain: Vec<String>,
    /// Call depth; equals `chain.len()` at each hop.
    pub depth: u32,
    /// Absolute wall-clock deadline in milliseconds since the epoch.
    pub deadline: u64,
}

impl CallContext {
    /// Creates a fresh context rooted at `service` with `deadline = now + timeout_ms`.
    pub fn new(service: impl Into<String>, timeout_ms: u64) -> Self {
        CallContext {
            root: generate_root_id(),
            chain: vec![service.into()],
            depth: 1,
            deadline: now_millis() + timeout_ms,
        }
    }

    /// Returns a copy extended by one hop through `service`.
    ///
    /// The chain grows, the depth increments, and `root`/`deadline` are
    /// carried unchanged.
    pub fn extend(&self, service: impl Into<String>) -> Self {
        let mut chain = self.chain.clone();
        chain.push(service.into());
        CallContext {
            root: self.root.clone(),
            chain,
            depth: self.depth + 1,
            deadline: self.deadline,
        }
    }

    /// Checks the structural invariants a well-formed context satisfies.
    pub fn validate(&self) -> Result<()> {
        if self.root.is_empty() {
            return Err(RpcError::InvalidContext("missing root id".to_string()));
        }
        if self.chain.is_empty() {
            return Err(RpcError::InvalidContext("empty call chain".to_string()));
        }
        if self.depth < 1 {
            return Err(RpcError::InvalidContext(format!(
                "depth must be >= 1, got {}",
                self.depth
            )));
        }
        Ok(())
    }

    /// Whether the absolute deadline has passed.
    ///
    /// Monotonic in wall-clock time: once true, stays true.
    pub fn is_deadline_exceeded(&self) -> bool {
        now_millis() > self.deadline
    }

    /// Time left before the deadline; zero if it already passed.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.deadline.saturating_sub(now_millis()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_shape() {
        let ctx = CallContext::new("svc", 1000);
        assert!(ctx.root.starts_with("root-"));
        assert_eq!(ctx.chain, vec!["svc".to_string()]);
        assert_eq!(ctx.depth, 1);
        assert!(ctx.deadline > now_millis());
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn test_extend_twice() {
        let ctx = CallContext::new("a", 60_000);
        let extended = ctx.extend("b").extend("c");
        assert_eq!(
            extended.chain,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(extended.depth, ctx.depth + 2);
        assert_eq!(extended.deadline, ctx.deadline);
        assert_eq!(extended.root, ctx.root);
    }

    #[test]
    fn test_extend_does_not_mutate_original() {
        let ctx = CallContext::new("a", 60_000);
        let _ = ctx.extend("b");
        assert_eq!(ctx.chain, vec!["a".to_string()]);
        assert_eq!(ctx.depth, 1);
    }

    #[test]
    fn test_deadline_exceeded() {
        let mut ctx = CallContext::new("a", 60_000);
        assert!(!ctx.is_deadline_exceeded());
        assert!(ctx.remaining() > Duration::ZERO);

        ctx.deadline = now_millis().saturating_sub(10);
        assert!(ctx.is_deadline_exceeded());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let mut ctx = CallContext::new("a", 1000);
        ctx.root = String::new();
        assert!(ctx.validate().is_err());

        let mut ctx = CallContext::new("a", 1000);
        ctx.chain.clear();
        assert!(ctx.validate().is_err());

        let mut ctx = CallContext::new("a", 1000);
        ctx.depth = 0;
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "req");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_root_id_prefix() {
        assert!(generate_root_id().starts_with("root-"));
    }

    #[test]
    fn test_id_uniqueness() {
        use std::collections::HashSet;
        let ids: HashSet<String> = (0..1000).map(|_| generate_request_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
