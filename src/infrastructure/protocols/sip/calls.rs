//! Call handling (INVITE, ACK, BYE, CANCEL, MESSAGE)
//!
//! [`CallSignaling`] is the default [`MessageHandler`]. [`translate`] turns
//! application requests into the messages that carry them.

use super::auth::DigestChallenge;
use super::builder::{self, ResponseBuilder};
use super::handler::{HandlerContext, HandlerOutcome, MessageHandler};
use super::header::{self, Field};
use super::message::{MessageType, SipMessage};
use super::sdp::{self, SdpSession};
use crate::domain::call::{CallData, CallPhase, DisconnectCause, MediaDescriptor};
use crate::domain::session::{AppRequest, SessionEvent};
use crate::domain::shared::error::SessionError;
use crate::domain::shared::result::Result;
use tracing::{debug, info, warn};

/// Failed call challenges answered before giving up
const MAX_CALL_AUTH_ATTEMPTS: u32 = 2;

/// Default call signalling
#[derive(Debug, Default, Clone)]
pub struct CallSignaling;

impl CallSignaling {
    pub fn new() -> Self {
        Self
    }

    fn on_request(&self, msg: &SipMessage, ctx: &HandlerContext) -> HandlerOutcome {
        match msg.kind() {
            MessageType::Invite => self.on_invite(msg, ctx),
            MessageType::Bye => self.on_bye(msg, ctx),
            MessageType::Cancel => self.on_cancel(msg, ctx),
            MessageType::Message => self.on_text(msg),
            MessageType::Info | MessageType::Update | MessageType::Prack => {
                HandlerOutcome::reply(builder::response_to(msg, 200))
            }
            other => {
                debug!("Rejecting unsupported request {}", other);
                HandlerOutcome::reply(builder::response_to(msg, 501))
            }
        }
    }

    fn on_response(&self, msg: &SipMessage, ctx: &HandlerContext) -> HandlerOutcome {
        match msg.kind() {
            MessageType::Invite => self.on_invite_response(msg, ctx),
            MessageType::Bye => self.on_bye_response(msg, ctx),
            MessageType::Cancel => self.on_cancel_response(msg, ctx),
            MessageType::Message => {
                if let Some(code) = msg.status().filter(|c| *c >= 300) {
                    warn!("Text message rejected with {}", code);
                }
                HandlerOutcome::none()
            }
            _ => HandlerOutcome::none(),
        }
    }

    fn on_invite(&self, msg: &SipMessage, ctx: &HandlerContext) -> HandlerOutcome {
        let Some(call_id) = msg.field(&Field::CallId).map(str::to_string) else {
            return HandlerOutcome::reply(builder::response_to(msg, 400));
        };
        let remote_media = sdp::extract(msg.field(&Field::ContentType), msg.body());

        if let Some(call) = ctx.calls.get(&call_id) {
            return self.on_invite_for_known_call(msg, ctx, call, remote_media);
        }

        let from = msg.field(&Field::From).unwrap_or_default();
        let remote_party = header::user(from).unwrap_or(from).to_string();
        let target = msg.target().unwrap_or_default().to_string();
        let mut call = CallData::incoming(call_id.clone(), builder::new_tag(), remote_party.clone(), target);
        call.setup_seq = msg.seq().unwrap_or(0);
        call.via = msg.field(&Field::Via).unwrap_or_default().to_string();
        call.from = from.to_string();
        call.to = msg.field(&Field::To).unwrap_or_default().to_string();
        call.remote_tag = header::tag(from).map(str::to_string);
        call.remote_contact = msg.field(&Field::Contact).map(|c| header::uri(c).to_string());
        call.user_to_user = msg.field(&Field::UserToUser).map(str::to_string);
        if let Some(media) = remote_media {
            call.video = media.has_video() && ctx.media.video_port.is_some();
            call.remote_media = media;
        }

        let ringing = ResponseBuilder::new(180)
            .to_tag(call.local_tag.clone())
            .field(Field::Contact, ctx.endpoint.contact())
            .build_for_request(msg);
        let event = SessionEvent::IncomingCall {
            call_id: call_id.clone(),
            from: remote_party,
            video: call.video,
            user_to_user: call.user_to_user.clone(),
        };
        info!("Incoming call {} from {}", call_id, call.remote_party);
        ctx.calls.insert(call);

        HandlerOutcome::reply(ringing).with_event(event)
    }

    /// INVITE carrying the Call-ID of a call already in the table: a
    /// retransmission of the request that set it up, or a re-INVITE.
    fn on_invite_for_known_call(
        &self,
        msg: &SipMessage,
        ctx: &HandlerContext,
        call: CallData,
        remote_media: Option<MediaDescriptor>,
    ) -> HandlerOutcome {
        let call_id = call.call_id.clone();
        let repeated = call.is_incoming() && msg.seq() == Some(call.setup_seq);

        if repeated && call.in_setup() {
            debug!("Retransmitted INVITE for ringing call {}", call_id);
            let ringing = ResponseBuilder::new(180)
                .to_tag(call.local_tag.clone())
                .field(Field::Contact, ctx.endpoint.contact())
                .build_for_request(msg);
            return HandlerOutcome::reply(ringing);
        }

        if call.phase != CallPhase::Established {
            debug!("INVITE for call {} in phase {:?} refused", call_id, call.phase);
            let pending = ResponseBuilder::new(491)
                .to_tag(call.local_tag.clone())
                .build_for_request(msg);
            return HandlerOutcome::reply(pending);
        }

        let local_sdp = call.local_sdp.clone().unwrap_or_default();
        let ok = ResponseBuilder::ok()
            .to_tag(call.local_tag.clone())
            .field(Field::Contact, ctx.endpoint.contact())
            .body(sdp::CONTENT_TYPE, local_sdp.into_bytes())
            .build_for_request(msg);
        if repeated {
            // Our 200 was lost; answer again without reporting anything new
            return HandlerOutcome::reply(ok);
        }

        ctx.calls.update(&call_id, |c| {
            if let Some(media) = &remote_media {
                c.remote_media = media.clone();
            }
            // Only the remote side's CSeq space is tracked for incoming calls
            if let (true, Some(seq)) = (c.is_incoming(), msg.seq()) {
                c.setup_seq = seq;
            }
        });
        let outcome = HandlerOutcome::reply(ok);
        match remote_media {
            Some(media) => outcome.with_event(SessionEvent::CallUpdated { call_id, media }),
            None => outcome,
        }
    }

    fn on_bye(&self, msg: &SipMessage, ctx: &HandlerContext) -> HandlerOutcome {
        let call_id = msg.field(&Field::CallId).unwrap_or_default();
        match ctx.calls.remove(call_id) {
            Some(call) => {
                info!("Call {} cleared by remote party", call_id);
                HandlerOutcome::reply(builder::response_to(msg, 200)).with_event(SessionEvent::CallEnded {
                    call_id: call.call_id,
                    cause: DisconnectCause::Normal,
                })
            }
            None => HandlerOutcome::reply(builder::response_to(msg, 481)),
        }
    }

    fn on_cancel(&self, msg: &SipMessage, ctx: &HandlerContext) -> HandlerOutcome {
        let call_id = msg.field(&Field::CallId).unwrap_or_default();
        let cancelable = ctx
            .calls
            .get(call_id)
            .filter(|c| c.is_incoming() && c.in_setup());
        let Some(call) = cancelable else {
            return HandlerOutcome::reply(builder::response_to(msg, 481));
        };
        ctx.calls.remove(call_id);

        let terminated = ResponseBuilder::new(487)
            .to_tag(call.local_tag.clone())
            .build_for_request(&setup_request(&call));
        HandlerOutcome::reply(builder::response_to(msg, 200))
            .with_reply(terminated)
            .with_event(SessionEvent::CallEnded {
                call_id: call.call_id,
                cause: DisconnectCause::Canceled,
            })
    }

    fn on_text(&self, msg: &SipMessage) -> HandlerOutcome {
        let from = msg.field(&Field::From).unwrap_or_default();
        let event = SessionEvent::TextMessage {
            from: header::user(from).unwrap_or(from).to_string(),
            content_type: msg.field(&Field::ContentType).map(str::to_string),
            body: String::from_utf8_lossy(msg.body()).into_owned(),
        };
        HandlerOutcome::reply(builder::response_to(msg, 200)).with_event(event)
    }

    fn on_invite_response(&self, msg: &SipMessage, ctx: &HandlerContext) -> HandlerOutcome {
        let call_id = msg.field(&Field::CallId).unwrap_or_default().to_string();
        let Some(call) = ctx.calls.get(&call_id) else {
            debug!("INVITE response for unknown call {}", call_id);
            return HandlerOutcome::none();
        };
        if call.is_incoming() {
            return HandlerOutcome::none();
        }
        if msg.seq() != Some(call.setup_seq) {
            debug!(
                "Stale INVITE response for {} (seq {:?}, expecting {})",
                call_id,
                msg.seq(),
                call.setup_seq
            );
            return HandlerOutcome::none();
        }

        let code = msg.status().unwrap_or(0);
        let remote_tag = msg.field(&Field::To).and_then(header::tag).map(str::to_string);
        match code {
            100 => HandlerOutcome::none(),
            101..=199 => {
                let first = ctx
                    .calls
                    .update(&call_id, |c| {
                        c.remote_tag = remote_tag.or(c.remote_tag.take());
                        let first = c.phase == CallPhase::Setup;
                        c.phase = CallPhase::Alerting;
                        first
                    })
                    .unwrap_or(false);
                if first {
                    HandlerOutcome::none().with_event(SessionEvent::CallRinging { call_id })
                } else {
                    HandlerOutcome::none()
                }
            }
            200..=299 => self.on_invite_accepted(msg, ctx, call, remote_tag),
            401 | 407 => self.on_invite_challenge(msg, ctx, call),
            _ => {
                ctx.calls.remove(&call_id);
                let ack = builder::ack(&ctx.endpoint, &call, msg);
                let cause = if call.canceled {
                    DisconnectCause::Canceled
                } else {
                    DisconnectCause::from_status(code)
                };
                info!("Call {} failed with {} ({:?})", call_id, code, cause);
                HandlerOutcome::reply(ack).with_event(SessionEvent::CallEnded { call_id, cause })
            }
        }
    }

    fn on_invite_accepted(
        &self,
        msg: &SipMessage,
        ctx: &HandlerContext,
        call: CallData,
        remote_tag: Option<String>,
    ) -> HandlerOutcome {
        let call_id = call.call_id.clone();
        let media = sdp::extract(msg.field(&Field::ContentType), msg.body()).unwrap_or_default();
        let contact = msg.field(&Field::Contact).map(|c| header::uri(c).to_string());

        let Some(call) = ctx.calls.update(&call_id, |c| {
            c.remote_tag = remote_tag.or(c.remote_tag.take());
            c.remote_contact = contact.or(c.remote_contact.take());
            if !media.is_empty() {
                c.remote_media = media.clone();
            }
            c.clone()
        }) else {
            return HandlerOutcome::none();
        };
        let ack = builder::ack(&ctx.endpoint, &call, msg);

        if call.canceled {
            // CANCEL lost the race against the answer
            ctx.calls.remove(&call_id);
            let bye = builder::in_dialog(&ctx.endpoint, MessageType::Bye, &call, ctx.sequence.next());
            return HandlerOutcome::reply(ack)
                .with_reply(bye)
                .with_event(SessionEvent::CallEnded {
                    call_id,
                    cause: DisconnectCause::Canceled,
                });
        }

        if call.phase == CallPhase::Established {
            // Retransmitted 2xx
            return HandlerOutcome::reply(ack);
        }
        ctx.calls.update(&call_id, |c| c.phase = CallPhase::Established);
        info!("Call {} connected", call_id);
        HandlerOutcome::reply(ack).with_event(SessionEvent::CallConnected {
            call_id,
            media: call.remote_media,
        })
    }

    fn on_invite_challenge(&self, msg: &SipMessage, ctx: &HandlerContext, mut call: CallData) -> HandlerOutcome {
        let call_id = call.call_id.clone();
        let ack = builder::ack(&ctx.endpoint, &call, msg);

        let challenge = DigestChallenge::from_message(msg);
        let Some(challenge) = challenge.filter(|_| call.auth_attempts < MAX_CALL_AUTH_ATTEMPTS) else {
            warn!("Giving up on call {} after authentication failure", call_id);
            ctx.calls.remove(&call_id);
            return HandlerOutcome::reply(ack).with_event(SessionEvent::CallEnded {
                call_id,
                cause: DisconnectCause::AuthenticationFailed,
            });
        };

        let seq = ctx.sequence.next();
        let mut invite = builder::invite(&ctx.endpoint, &mut call, seq);
        let credentials = ctx.digest.answer(
            &challenge,
            &ctx.endpoint.identity,
            MessageType::Invite.method_name(),
            ctx.endpoint.scheme(),
            &call.target_uri,
        );
        call.authorization = Some(credentials.apply(&mut invite));
        call.auth_attempts += 1;
        debug!("Re-sending INVITE for {} with credentials (seq {})", call_id, seq);
        ctx.calls.insert(call);

        HandlerOutcome::reply(ack).with_reply(invite)
    }

    fn on_bye_response(&self, msg: &SipMessage, ctx: &HandlerContext) -> HandlerOutcome {
        if msg.status().unwrap_or(0) < 200 {
            return HandlerOutcome::none();
        }
        let call_id = msg.field(&Field::CallId).unwrap_or_default();
        match ctx.calls.remove(call_id) {
            Some(call) => HandlerOutcome::none().with_event(SessionEvent::CallEnded {
                call_id: call.call_id,
                cause: DisconnectCause::Normal,
            }),
            None => HandlerOutcome::none(),
        }
    }

    fn on_cancel_response(&self, msg: &SipMessage, ctx: &HandlerContext) -> HandlerOutcome {
        // On success the INVITE is answered with 487, which ends the call
        if msg.status() != Some(481) {
            return HandlerOutcome::none();
        }
        let call_id = msg.field(&Field::CallId).unwrap_or_default();
        match ctx.calls.remove(call_id) {
            Some(call) => HandlerOutcome::none().with_event(SessionEvent::CallEnded {
                call_id: call.call_id,
                cause: DisconnectCause::Canceled,
            }),
            None => HandlerOutcome::none(),
        }
    }
}

impl MessageHandler for CallSignaling {
    fn handle(&self, message: &SipMessage, ctx: &HandlerContext) -> HandlerOutcome {
        if message.is_request() {
            self.on_request(message, ctx)
        } else {
            self.on_response(message, ctx)
        }
    }
}

/// The INVITE an incoming call was set up with, rebuilt from the cached
/// correlation fields so responses to it can be generated later
fn setup_request(call: &CallData) -> SipMessage {
    let mut invite = SipMessage::request(MessageType::Invite, call.target_uri.clone());
    invite.set_cseq(call.setup_seq, MessageType::Invite);
    invite.set_field(Field::Via, call.via.clone());
    invite.set_field(Field::From, call.from.clone());
    invite.set_field(Field::To, call.to.clone());
    invite.set_field(Field::CallId, call.call_id.clone());
    invite
}

/// Messages produced by one application request
#[derive(Debug, Default)]
pub struct Translation {
    /// Call the request created or acted on
    pub call_id: Option<String>,
    pub messages: Vec<SipMessage>,
}

/// Translate an application request into protocol messages.
///
/// Unregister is handled by the session itself and yields nothing here.
pub fn translate(request: &AppRequest, ctx: &HandlerContext) -> Result<Translation> {
    match request {
        AppRequest::PlaceCall {
            target,
            video,
            user_to_user,
        } => {
            let target_uri = ctx.endpoint.uri_for(target);
            let remote_party = header::user(&target_uri).unwrap_or(target).to_string();
            let call_id = builder::new_call_id(&ctx.endpoint.server_host);
            let mut call = CallData::outgoing(call_id.clone(), builder::new_tag(), remote_party, target_uri);
            call.video = *video && ctx.media.video_port.is_some();
            call.user_to_user = user_to_user.clone();

            let offer = SdpSession::offer(&ctx.media_address(), &ctx.media, call.video);
            call.local_media = offer.descriptor();
            call.local_sdp = Some(offer.to_string());

            let invite = builder::invite(&ctx.endpoint, &mut call, ctx.sequence.next());
            info!("Placing call {} to {}", call_id, call.target_uri);
            ctx.calls.insert(call);
            Ok(Translation {
                call_id: Some(call_id),
                messages: vec![invite],
            })
        }
        AppRequest::Answer { call_id } => {
            let call = incoming_in_setup(ctx, call_id)?;
            let answer = SdpSession::offer(&ctx.media_address(), &ctx.media, call.video);
            let body = answer.to_string();
            let response = ResponseBuilder::ok()
                .to_tag(call.local_tag.clone())
                .field(Field::Contact, ctx.endpoint.contact())
                .body(sdp::CONTENT_TYPE, body.clone().into_bytes())
                .build_for_request(&setup_request(&call));
            ctx.calls.update(call_id, |c| {
                c.phase = CallPhase::Established;
                c.local_media = answer.descriptor();
                c.local_sdp = Some(body);
            });
            Ok(Translation {
                call_id: Some(call_id.clone()),
                messages: vec![response],
            })
        }
        AppRequest::Reject { call_id } => {
            let call = incoming_in_setup(ctx, call_id)?;
            ctx.calls.remove(call_id);
            Ok(Translation {
                call_id: Some(call_id.clone()),
                messages: vec![decline(&call)],
            })
        }
        AppRequest::Hangup { call_id } => {
            let call = ctx
                .calls
                .get(call_id)
                .ok_or_else(|| SessionError::UnknownCall(call_id.clone()))?;
            let message = match (call.is_incoming(), call.in_setup()) {
                (true, true) => {
                    ctx.calls.remove(call_id);
                    decline(&call)
                }
                (false, true) => {
                    ctx.calls.update(call_id, |c| c.canceled = true);
                    builder::cancel(&call)
                }
                _ => {
                    ctx.calls.update(call_id, |c| c.phase = CallPhase::Terminating);
                    builder::in_dialog(&ctx.endpoint, MessageType::Bye, &call, ctx.sequence.next())
                }
            };
            Ok(Translation {
                call_id: Some(call_id.clone()),
                messages: vec![message],
            })
        }
        AppRequest::SendText { target, body } => Ok(Translation {
            call_id: None,
            messages: vec![builder::text_message(
                &ctx.endpoint,
                target,
                ctx.sequence.next(),
                body,
            )],
        }),
        AppRequest::Unregister { .. } => Ok(Translation::default()),
    }
}

fn incoming_in_setup(ctx: &HandlerContext, call_id: &str) -> Result<CallData> {
    let call = ctx
        .calls
        .get(call_id)
        .ok_or_else(|| SessionError::UnknownCall(call_id.to_string()))?;
    if !call.is_incoming() || !call.in_setup() {
        return Err(SessionError::InvalidStateTransition(format!(
            "call {} is not an incoming call awaiting an answer",
            call_id
        )));
    }
    Ok(call)
}

fn decline(call: &CallData) -> SipMessage {
    ResponseBuilder::new(603)
        .to_tag(call.local_tag.clone())
        .build_for_request(&setup_request(call))
}
