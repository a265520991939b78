//! The coalescing decision.
//!
//! Pure functions over a target address, a candidate connection and a fresh
//! DNS answer, kept free of pool state so the decision table can be tested
//! with fake collaborators and no networking. The pool interleaves the one
//! stateful step, the health check, between the route gate and the
//! certificate gate.
//!
//! Every rejection here means "keep searching, or dial fresh". None of it is
//! an error.

use std::net::IpAddr;

use crate::address::Address;
use crate::cert::chain_covers;
use crate::conn::Connection;

/// Route-level eligibility: the verifier gate and the DNS overlap test.
///
/// The resolved list belongs to the target hostname, freshly looked up. The
/// candidate only ever dialed one IP, so membership of that IP in the list
/// is the whole overlap test; an empty answer rejects.
pub fn routes_overlap(target: &Address, candidate: &Connection, resolved: &[IpAddr]) -> bool {
    if !target.is_compatible(candidate.address()) {
        return false;
    }
    resolved.contains(&candidate.route().ip())
}

/// Certificate-level eligibility: subject alternative name coverage and
/// pinning.
///
/// The leaf must name the target host in its subject alternative names; the
/// common name never participates. Pins declared for the target host must
/// be satisfied somewhere in the candidate's chain, and a host without pins
/// passes trivially.
pub fn certificate_covers(target: &Address, candidate: &Connection) -> bool {
    let chain = candidate.session().peer_certificates();
    if !chain_covers(chain, target.host()) {
        return false;
    }
    target.tls().pinner().check(target.host(), chain)
}
