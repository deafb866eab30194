//! REGISTER / unregister and the handling of their responses

use super::{Inner, Outbound};
use crate::domain::call::DisconnectCause;
use crate::domain::session::{RegistrationAttempt, SessionEvent, SessionState};
use crate::infrastructure::protocols::sip::auth::DigestChallenge;
use crate::infrastructure::protocols::sip::builder;
use crate::infrastructure::protocols::sip::header::{self, Field};
use crate::infrastructure::protocols::sip::message::{MessageType, SipMessage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl Inner {
    /// REGISTER the local identity
    pub(super) fn register_local(&self) {
        self.send_registration(&self.config.identity, false);
    }

    /// Send a REGISTER (or unregister) for `identity`, answering the last
    /// registrar challenge if there is one. Returns the sequence id used.
    pub(super) fn send_registration(&self, identity: &str, unregister: bool) -> u32 {
        let seq = self.sequence.next();
        let endpoint = self.endpoint.read().clone();
        let expires = if unregister {
            0
        } else {
            self.config.register_expires
        };
        let (call_id, tag, challenge) = {
            let registrar = self.registrar.lock();
            (
                registrar.call_id.clone(),
                registrar.tag.clone(),
                registrar.challenge.clone(),
            )
        };

        let mut msg = builder::register(&endpoint, identity, seq, &call_id, &tag, expires);
        let nonce = challenge.map(|challenge| {
            let target = msg.target().unwrap_or_default().to_string();
            let credentials = self.digest.answer(
                &challenge,
                &endpoint.identity,
                MessageType::Register.method_name(),
                endpoint.scheme(),
                &target,
            );
            credentials.apply(&mut msg);
            challenge.nonce
        });

        self.registrations
            .lock()
            .insert(RegistrationAttempt::new(seq, identity, unregister).with_nonce(nonce));
        info!(
            "Sending {} for {} (seq {})",
            if unregister { "unregister" } else { "REGISTER" },
            identity,
            seq
        );
        self.enqueue(Outbound::new(msg));
        seq
    }

    /// Resolve a REGISTER response against its pending attempt
    pub(super) fn on_register_response(self: &Arc<Self>, msg: &SipMessage) {
        let code = msg.status().unwrap_or(0);
        if code < 200 {
            return;
        }
        let Some(seq) = msg.seq() else {
            warn!("REGISTER response without sequence id");
            return;
        };
        // Taking the attempt out under the table lock makes the decision
        // below happen at most once per request
        let Some(attempt) = self.registrations.lock().take(seq) else {
            debug!("REGISTER response {} for unknown seq {}, discarding", code, seq);
            return;
        };

        match code {
            200..=299 => self.on_registration_accepted(msg, &attempt),
            401 | 407 => self.on_registration_challenge(msg, &attempt),
            403 => {
                warn!("Registration for {} forbidden", attempt.identity);
                self.registration_failed(DisconnectCause::AuthenticationFailed);
            }
            503 => {
                let delay = msg
                    .number(&Field::RetryAfter)
                    .map(|secs| Duration::from_secs(u64::from(secs)))
                    .unwrap_or(self.config.timing.unavailable_backoff);
                warn!("Registrar unavailable, retrying in {:?}", delay);
                self.retry_registration(attempt, delay);
            }
            _ => {
                warn!("Registration for {} failed with {}", attempt.identity, code);
                self.registration_failed(DisconnectCause::from_status(code));
            }
        }
    }

    fn on_registration_accepted(self: &Arc<Self>, msg: &SipMessage, attempt: &RegistrationAttempt) {
        let local = attempt.identity == self.config.identity;
        if attempt.unregister || !local {
            info!("Unregister confirmed for {}", attempt.identity);
            self.emit(SessionEvent::Unregistered {
                identity: attempt.identity.clone(),
            });
            if local && attempt.unregister {
                self.set_state(SessionState::Stopped);
            }
            return;
        }

        let expires = granted_expiry(msg).unwrap_or(self.config.register_expires);
        if self.set_state(SessionState::Registered) {
            info!("Registered {} for {}s", attempt.identity, expires);
            self.emit(SessionEvent::Registered);
        } else {
            debug!("Registration refreshed for {}s", expires);
        }
        self.schedule_refresh(expires);
    }

    fn on_registration_challenge(&self, msg: &SipMessage, attempt: &RegistrationAttempt) {
        let Some(challenge) = DigestChallenge::from_message(msg) else {
            warn!("Challenge without usable digest parameters");
            self.registration_failed(DisconnectCause::AuthenticationFailed);
            return;
        };
        if attempt.nonce.as_deref() == Some(challenge.nonce.as_str()) && !challenge.stale {
            warn!(
                "Credentials for {} rejected (realm {})",
                attempt.identity, challenge.realm
            );
            self.registrar.lock().challenge = None;
            self.registration_failed(DisconnectCause::AuthenticationFailed);
            return;
        }

        debug!(
            "Answering challenge for {} (realm {}, stale {})",
            attempt.identity, challenge.realm, challenge.stale
        );
        self.registrar.lock().challenge = Some(challenge);
        self.send_registration(&attempt.identity, attempt.unregister);
    }

    fn registration_failed(&self, cause: DisconnectCause) {
        self.emit(SessionEvent::RegistrationFailed { cause });
    }

    fn retry_registration(self: &Arc<Self>, attempt: RegistrationAttempt, delay: Duration) {
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = inner.state.stopped() => return,
            }
            inner.send_registration(&attempt.identity, attempt.unregister);
        });
        let mut backoffs = self.backoffs.lock();
        backoffs.retain(|h| !h.is_finished());
        backoffs.push(handle);
    }

    /// Re-register after 90 % of the granted expiry
    fn schedule_refresh(self: &Arc<Self>, expires: u32) {
        let delay = Duration::from_secs(u64::from(expires) * 9 / 10).max(Duration::from_secs(1));
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = inner.state.stopped() => return,
            }
            if inner.state.get() == SessionState::Registered {
                debug!("Refreshing registration");
                inner.register_local();
            }
        });
        if let Some(previous) = self.refresh.lock().replace(handle) {
            previous.abort();
        }
    }
}

/// Expiry granted by the registrar: Contact `expires` parameter, else the
/// Expires field. Zero counts as absent.
fn granted_expiry(msg: &SipMessage) -> Option<u32> {
    msg.field(&Field::Contact)
        .and_then(|contact| header::param(contact, "expires"))
        .and_then(|value| value.trim().parse::<u32>().ok())
        .or_else(|| msg.number(&Field::Expires))
        .filter(|secs| *secs > 0)
}
