//! Transfer broker state machine.
//!
//! The broker never touches pipes. Each call to [`Broker::handle`] consumes
//! one message from a session and returns the messages to deliver; the only
//! side effect it performs itself is the privileged copy behind
//! [`TransferFs`].
use std::collections::HashMap;

use ipc::{Message, RequestId, Status, TransferRequest};
use nix::unistd::Pid;
use tracing::{debug, error, info, instrument, warn};

use crate::arena::Arena;
use crate::errors::TransferError;
use crate::log::TARGET;

/// A session slot together with the worker that owned it when the
/// reference was taken. Slots are reused, so the pid tells a live session
/// apart from a later occupant of the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionRef {
    pub slot: usize,
    pub pid: Pid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recipient {
    Session(SessionRef),
    Everyone,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub to: Recipient,
    pub message: Message,
}

impl Envelope {
    fn to(session: SessionRef, message: Message) -> Self {
        Self {
            to: Recipient::Session(session),
            message,
        }
    }
}

/// Filesystem effects of an accepted transfer.
pub trait TransferFs {
    /// Copy `request.path` over `destination` and leave the copy owned by
    /// `request.receiver`.
    fn copy(&mut self, request: &TransferRequest, destination: &str) -> Result<(), TransferError>;
}

#[derive(Debug)]
struct Pending {
    request: TransferRequest,
    /// Sessions that have already been shown this request.
    offered_to: Vec<SessionRef>,
}

#[derive(Debug)]
pub struct Broker {
    next_id: RequestId,
    pending: Arena<Pending>,
    /// Session that opened each request, where its outcome is delivered.
    origins: HashMap<RequestId, SessionRef>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: Arena::new(),
            origins: HashMap::new(),
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &TransferRequest> {
        self.pending.iter().map(|(_, pending)| &pending.request)
    }

    /// Process one message from session `from`. `username` is the identity
    /// the session last announced, if any; it takes precedence over names
    /// the message claims for itself.
    #[instrument(skip_all, fields(status = %msg.status, id = msg.request.id, slot = from.slot))]
    pub fn handle(
        &mut self,
        from: SessionRef,
        username: Option<&str>,
        msg: Message,
        fs: &mut impl TransferFs,
    ) -> Vec<Envelope> {
        let Message { status, request } = msg;
        match status {
            Status::NewRequest => self.open(from, username, request),
            Status::IAmUser => self.offer(from, &request.sender),
            Status::Accept => {
                let replier = username.unwrap_or(request.sender.as_str());
                self.accept(from, replier, request.id, &request.path, fs)
            }
            Status::Reject => {
                let replier = username.unwrap_or(request.sender.as_str());
                self.reject(from, replier, request.id)
            }
            Status::TransferRequest | Status::Handled | Status::WhoAreYou | Status::Rejected => {
                warn!("Workers do not send {status}, ignoring");
                vec![]
            }
        }
    }

    /// Offer `id` did not reach `session`; show it again on the next
    /// announcement.
    pub fn offer_failed(&mut self, session: SessionRef, id: RequestId) {
        for (_, pending) in self.pending.iter_mut() {
            if pending.request.id == id {
                pending.offered_to.retain(|seen| *seen != session);
            }
        }
    }

    /// A worker is gone; forget which requests it has seen.
    pub fn session_closed(&mut self, session: SessionRef) {
        for (_, pending) in self.pending.iter_mut() {
            pending.offered_to.retain(|seen| *seen != session);
        }
        for (id, origin) in &self.origins {
            if *origin == session {
                debug!(id, "Requesting session closed before its transfer resolved");
            }
        }
    }

    fn open(
        &mut self,
        from: SessionRef,
        username: Option<&str>,
        request: TransferRequest,
    ) -> Vec<Envelope> {
        let TransferRequest {
            sender,
            receiver,
            path,
            ..
        } = request;
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        let request = TransferRequest {
            id,
            sender: username.map_or(sender, str::to_string),
            receiver,
            path,
        };
        info!(
            target: TARGET,
            kind = "requested",
            id,
            session = from.slot,
            sender = request.sender.as_str(),
            receiver = request.receiver.as_str(),
            path = request.path.as_str()
        );
        self.pending.insert(Pending {
            request,
            offered_to: vec![],
        });
        self.origins.insert(id, from);
        vec![Envelope {
            to: Recipient::Everyone,
            message: Message::who_are_you(),
        }]
    }

    fn offer(&mut self, from: SessionRef, username: &str) -> Vec<Envelope> {
        let mut offers = vec![];
        for (_, pending) in self.pending.iter_mut() {
            if pending.request.receiver == username && !pending.offered_to.contains(&from) {
                pending.offered_to.push(from);
                offers.push(pending.request.clone());
            }
        }
        offers.sort_by_key(|request| request.id);
        offers
            .iter()
            .map(|request| {
                info!(
                    target: TARGET,
                    kind = "offered",
                    id = request.id,
                    session = from.slot,
                    sender = request.sender.as_str(),
                    receiver = request.receiver.as_str(),
                    path = request.path.as_str()
                );
                Envelope::to(from, Message::offer(request))
            })
            .collect()
    }

    /// Pop request `id` if `replier` is its receiver. A reply from anyone
    /// else puts the request back untouched.
    fn take(&mut self, id: RequestId, replier: &str) -> Option<(Pending, Option<SessionRef>)> {
        let Some(index) = self.pending.position(|pending| pending.request.id == id) else {
            debug!("Ignoring reply to unknown request");
            return None;
        };
        let pending = self.pending.remove(index)?;
        if pending.request.receiver != replier {
            warn!(
                replier,
                receiver = pending.request.receiver.as_str(),
                "Reply from a user other than the receiver, requeueing"
            );
            self.pending.insert(pending);
            return None;
        }
        let origin = self.origins.remove(&id);
        Some((pending, origin))
    }

    fn requeue(&mut self, pending: Pending, origin: Option<SessionRef>) {
        if let Some(origin) = origin {
            self.origins.insert(pending.request.id, origin);
        }
        self.pending.insert(pending);
    }

    fn accept(
        &mut self,
        from: SessionRef,
        replier: &str,
        id: RequestId,
        destination: &str,
        fs: &mut impl TransferFs,
    ) -> Vec<Envelope> {
        let Some((pending, origin)) = self.take(id, replier) else {
            return vec![];
        };
        if let Err(e) = fs.copy(&pending.request, destination) {
            if let TransferError::InUse(path) = &e {
                warn!(path = %path.display(), "Transfer path is locked, request stays pending");
                self.requeue(pending, origin);
                return vec![];
            }
            let request = pending.request;
            error!(
                target: TARGET,
                kind = "failed",
                id,
                session = from.slot,
                sender = request.sender.as_str(),
                receiver = request.receiver.as_str(),
                path = destination,
                "Transfer copy failed: {e}"
            );
            return vec![];
        }
        let request = pending.request;
        info!(
            target: TARGET,
            kind = "accepted",
            id,
            session = from.slot,
            sender = request.sender.as_str(),
            receiver = request.receiver.as_str(),
            path = destination
        );
        Self::outcome(Message::handled(id), origin, from)
    }

    fn reject(&mut self, from: SessionRef, replier: &str, id: RequestId) -> Vec<Envelope> {
        let Some((Pending { request, .. }, origin)) = self.take(id, replier) else {
            return vec![];
        };
        info!(
            target: TARGET,
            kind = "rejected",
            id,
            session = from.slot,
            sender = request.sender.as_str(),
            receiver = request.receiver.as_str(),
            path = request.path.as_str()
        );
        Self::outcome(Message::rejected(id), origin, from)
    }

    fn outcome(message: Message, origin: Option<SessionRef>, replier: SessionRef) -> Vec<Envelope> {
        let mut out = Vec::with_capacity(2);
        match origin {
            Some(origin) => out.push(Envelope::to(origin, message.clone())),
            None => warn!(id = message.request.id, "Request has no recorded origin"),
        }
        out.push(Envelope::to(replier, message));
        out
    }
}
