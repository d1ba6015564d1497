//! Wires a concrete `SignatureOracle` into the process. The signing
//! algorithms themselves (`sign_push_channel`, `compute_a_bogus`) belong to
//! the platform's closed anti-bot JS and are never reimplemented here — see
//! `session::protocol::SignatureOracle`. This module is the single
//! injection point a deployment swaps out for its own oracle (a V8 isolate
//! running the vendored JS, a sidecar RPC call, whatever the operator has).

use crate::core::{IngestError, Result};
use crate::session::protocol::SignatureOracle;

/// Placeholder oracle used when no real signer is configured. Every call
/// fails with `IngestError::SignatureOracle`, which the push-channel and
/// discovery call sites already treat as a retryable/fatal condition
/// depending on context. Replace with a real implementation before
/// deploying against the live platform.
pub struct UnconfiguredOracle;

impl SignatureOracle for UnconfiguredOracle {
    fn sign_push_channel(&self, _digest_hex: &str) -> Result<String> {
        Err(IngestError::SignatureOracle)
    }

    fn compute_a_bogus(&self, _query_string: &str, _user_agent: &str) -> Result<String> {
        Err(IngestError::SignatureOracle)
    }
}
