//! Pending-connection staging area (§4.2 "Pending-connection staging").
//!
//! A freshly accepted connection lives here until it either announces or
//! requests an id and, if the router requires one, proves it knows the
//! router password. Promotion moves it into a [`super::routed_node::RoutedNode`];
//! failure to complete the handshake in time drops it.
//!
//! The handshake is driven reactively rather than by the router proactively
//! pushing "assign-id" the instant a connection is accepted: the router
//! waits for the peer's own `requestId` / `annEndptId`, matching the
//! identity-acquisition contract `Endpoint` already implements (it decides
//! for itself, based on whether it was constructed with a preconfigured id,
//! which of those two messages to send). Assigning proactively and then
//! potentially overriding with `confirmId` would double-allocate ids for no
//! benefit.

use crate::connection::Connection;
use crate::message::{special, EndpointId, Message, Priority};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Overall hard timeout for a pending connection to complete its handshake.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);
/// Retry period for the password nonce while waiting on a proof.
pub const DEFAULT_PASSWORD_RETRY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingIdClaim,
    AwaitingPassword,
    Ready,
}

pub struct PendingConnection {
    pub connection: Box<dyn Connection>,
    stage: Stage,
    created_at: Instant,
    claimed_id: Option<EndpointId>,
    preconfigured: bool,
    expected_proof: Option<u64>,
    last_password_request: Option<Instant>,
}

impl PendingConnection {
    pub fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            connection,
            stage: Stage::AwaitingIdClaim,
            created_at: Instant::now(),
            claimed_id: None,
            preconfigured: false,
            expected_proof: None,
            last_password_request: None,
        }
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.created_at) > timeout
    }

    pub fn is_ready(&self) -> bool {
        self.stage == Stage::Ready
    }

    /// The id to promote this connection under, once ready.
    pub fn claimed_id(&self) -> Option<EndpointId> {
        self.claimed_id
    }

    /// Feed one message observed from the pending connection. Returns the
    /// reply to send back immediately, if any.
    pub fn observe(&mut self, message: &Message, next_free_id: impl FnOnce() -> EndpointId) -> Option<Message> {
        if message.message_id == special::request_id() {
            let id = next_free_id();
            self.claimed_id = Some(id);
            self.preconfigured = false;
            self.stage = Stage::AwaitingPassword;
            return Some(Message::new(special::assign_id(), EndpointId::BROADCAST, id, Priority::High, vec![]));
        }
        if message.message_id == special::announce_id() {
            if let Ok(id) = bincode::deserialize::<u64>(&message.payload) {
                let id = EndpointId(id);
                self.claimed_id = Some(id);
                self.preconfigured = true;
                self.stage = Stage::AwaitingPassword;
                return Some(Message::new(special::confirm_id(), EndpointId::BROADCAST, id, Priority::High, vec![]));
            }
        }
        if message.message_id == special::encrypted_router_password() {
            if let Ok(proof) = bincode::deserialize::<u64>(&message.payload) {
                if Some(proof) == self.expected_proof {
                    self.stage = Stage::Ready;
                }
            }
        }
        None
    }

    /// Drive the password stage: send (or retry) the nonce challenge once an
    /// id has been claimed. No-op if no password is configured or we've
    /// already moved past this stage.
    pub fn maybe_request_password(&mut self, password: Option<&str>, now: Instant) -> Option<Message> {
        if self.stage != Stage::AwaitingPassword {
            return None;
        }
        let Some(password) = password else {
            self.stage = Stage::Ready;
            return None;
        };
        let due = match self.last_password_request {
            None => true,
            Some(last) => now.duration_since(last) >= DEFAULT_PASSWORD_RETRY,
        };
        if !due {
            return None;
        }
        let nonce = fresh_nonce(self.created_at, now, self.last_password_request);
        self.last_password_request = Some(now);
        self.expected_proof = Some(expected_proof(password, nonce));
        let payload = bincode::serialize(&nonce).ok()?;
        Some(Message::new(special::request_router_password(), EndpointId::BROADCAST, EndpointId::BROADCAST, Priority::High, payload))
    }
}

/// A nonce that varies across retries so a captured proof can't be replayed.
fn fresh_nonce(created_at: Instant, now: Instant, previous_attempt: Option<Instant>) -> u64 {
    let mut hasher = DefaultHasher::new();
    created_at.hash(&mut hasher);
    now.hash(&mut hasher);
    previous_attempt.hash(&mut hasher);
    hasher.finish()
}

fn expected_proof(password: &str, nonce: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    password.hash(&mut hasher);
    nonce.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::in_process::in_process_pair;
    use crate::message::MessageId;

    fn pending() -> PendingConnection {
        let (a, _b) = in_process_pair(4096);
        PendingConnection::new(Box::new(a))
    }

    #[test]
    fn request_id_claims_a_fresh_id_and_replies_assign() {
        let mut p = pending();
        let msg = Message::new(special::request_id(), EndpointId(0), EndpointId(0), Priority::Normal, vec![]);
        let reply = p.observe(&msg, || EndpointId(42)).unwrap();
        assert_eq!(reply.message_id, special::assign_id());
        assert_eq!(reply.target_id, EndpointId(42));
        assert_eq!(p.claimed_id(), Some(EndpointId(42)));
    }

    #[test]
    fn announce_id_claims_the_preconfigured_id_and_replies_confirm() {
        let mut p = pending();
        let payload = bincode::serialize(&7u64).unwrap();
        let msg = Message::new(special::announce_id(), EndpointId(0), EndpointId(0), Priority::Normal, payload);
        let reply = p.observe(&msg, || EndpointId(999)).unwrap();
        assert_eq!(reply.message_id, special::confirm_id());
        assert_eq!(reply.target_id, EndpointId(7));
        assert_eq!(p.claimed_id(), Some(EndpointId(7)));
    }

    #[test]
    fn without_a_password_claiming_an_id_is_enough_to_be_ready() {
        let mut p = pending();
        let msg = Message::new(special::request_id(), EndpointId(0), EndpointId(0), Priority::Normal, vec![]);
        p.observe(&msg, || EndpointId(1));
        assert!(!p.is_ready());
        let challenge = p.maybe_request_password(None, Instant::now());
        assert!(challenge.is_none());
        assert!(p.is_ready());
    }

    #[test]
    fn correct_password_proof_completes_the_handshake() {
        let mut p = pending();
        let msg = Message::new(special::request_id(), EndpointId(0), EndpointId(0), Priority::Normal, vec![]);
        p.observe(&msg, || EndpointId(1));

        let challenge = p.maybe_request_password(Some("hunter2"), Instant::now()).unwrap();
        assert_eq!(challenge.message_id, special::request_router_password());
        let nonce: u64 = bincode::deserialize(&challenge.payload).unwrap();

        let proof = expected_proof("hunter2", nonce);
        let proof_msg = Message::new(special::encrypted_router_password(), EndpointId(0), EndpointId(0), Priority::Normal, bincode::serialize(&proof).unwrap());
        p.observe(&proof_msg, || unreachable!());
        assert!(p.is_ready());
    }

    #[test]
    fn wrong_password_proof_does_not_complete_the_handshake() {
        let mut p = pending();
        let msg = Message::new(special::request_id(), EndpointId(0), EndpointId(0), Priority::Normal, vec![]);
        p.observe(&msg, || EndpointId(1));
        p.maybe_request_password(Some("hunter2"), Instant::now());

        let bogus = Message::new(special::encrypted_router_password(), EndpointId(0), EndpointId(0), Priority::Normal, bincode::serialize(&0xdead_u64).unwrap());
        p.observe(&bogus, || unreachable!());
        assert!(!p.is_ready());
    }

    #[test]
    fn expires_after_the_overall_timeout() {
        let p = pending();
        let now = Instant::now();
        assert!(!p.is_expired(now, DEFAULT_PENDING_TIMEOUT));
        assert!(p.is_expired(now + DEFAULT_PENDING_TIMEOUT + Duration::from_secs(1), DEFAULT_PENDING_TIMEOUT));
    }

    #[test]
    fn password_retry_waits_for_the_retry_period() {
        let mut p = pending();
        let msg = Message::new(special::request_id(), EndpointId(0), EndpointId(0), Priority::Normal, vec![]);
        p.observe(&msg, || EndpointId(1));

        let t0 = Instant::now();
        assert!(p.maybe_request_password(Some("x"), t0).is_some());
        assert!(p.maybe_request_password(Some("x"), t0).is_none());
        assert!(p.maybe_request_password(Some("x"), t0 + DEFAULT_PASSWORD_RETRY).is_some());
    }

    #[test]
    fn unrelated_message_id_is_ignored() {
        let mut p = pending();
        let msg = Message::new(MessageId::new("app", "noise"), EndpointId(0), EndpointId(0), Priority::Normal, vec![]);
        assert!(p.observe(&msg, || unreachable!()).is_none());
    }
}
