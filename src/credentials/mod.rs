/// Short-lived bearer credentials issued by the queue server
use crate::events::{ClientEvent, EventSink};
use crate::models::TokenGrant;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// How long an unanswered refresh request suppresses a repeat
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The two independently refreshed credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Authorizes provider-A playback commands
    Playback,
    /// Authorizes catalogue search
    Search,
}

impl CredentialKind {
    fn refresh_event(&self) -> ClientEvent {
        match self {
            CredentialKind::Playback => ClientEvent::FetchAuthToken,
            CredentialKind::Search => ClientEvent::FetchSearchToken,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Playback => "playback",
            CredentialKind::Search => "search",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CredentialState {
    Absent,
    Requested { since: Instant },
    Held { token: String, expires_at: Instant },
}

#[derive(Debug)]
struct Credential {
    kind: CredentialKind,
    state: CredentialState,
}

impl Credential {
    fn new(kind: CredentialKind) -> Self {
        Self {
            kind,
            state: CredentialState::Absent,
        }
    }

    fn token(&self, now: Instant) -> Option<&str> {
        match &self.state {
            CredentialState::Held { token, expires_at } if now < *expires_at => Some(token),
            _ => None,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self.state {
            CredentialState::Held { expires_at, .. } => Some(expires_at),
            _ => None,
        }
    }

    fn outstanding(&self, now: Instant) -> bool {
        matches!(self.state, CredentialState::Requested { since } if now < since + REQUEST_TIMEOUT)
    }
}

/// Credential Cache.
///
/// Owned by the session task. The playback token is mirrored into a watch
/// channel so the provider-A driver always reads the current value.
#[derive(Debug)]
pub struct CredentialCache {
    playback: Credential,
    search: Credential,
    playback_tx: watch::Sender<Option<String>>,
    reauth_armed: bool,
    reauth_in_flight: bool,
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialCache {
    pub fn new() -> Self {
        let (playback_tx, _) = watch::channel(None);
        Self {
            playback: Credential::new(CredentialKind::Playback),
            search: Credential::new(CredentialKind::Search),
            playback_tx,
            reauth_armed: false,
            reauth_in_flight: false,
        }
    }

    /// Receiver that always holds the usable playback token, if any
    pub fn playback_token(&self) -> watch::Receiver<Option<String>> {
        self.playback_tx.subscribe()
    }

    fn slot(&self, kind: CredentialKind) -> &Credential {
        match kind {
            CredentialKind::Playback => &self.playback,
            CredentialKind::Search => &self.search,
        }
    }

    fn slot_mut(&mut self, kind: CredentialKind) -> &mut Credential {
        match kind {
            CredentialKind::Playback => &mut self.playback,
            CredentialKind::Search => &mut self.search,
        }
    }

    fn publish(&self, kind: CredentialKind, now: Instant) {
        if kind == CredentialKind::Playback {
            let token = self.playback.token(now).map(str::to_string);
            self.playback_tx.send_replace(token);
        }
    }

    pub fn token(&self, kind: CredentialKind, now: Instant) -> Option<&str> {
        self.slot(kind).token(now)
    }

    pub fn is_held(&self, kind: CredentialKind, now: Instant) -> bool {
        self.token(kind, now).is_some()
    }

    /// Ask the server for a credential unless a request is already outstanding.
    /// Returns whether a request was emitted.
    pub fn request(&mut self, kind: CredentialKind, sink: &dyn EventSink, now: Instant) -> bool {
        let slot = self.slot_mut(kind);
        if slot.outstanding(now) {
            debug!(credential = kind.as_str(), "Refresh already outstanding");
            return false;
        }
        if matches!(slot.state, CredentialState::Absent | CredentialState::Requested { .. }) {
            slot.state = CredentialState::Requested { since: now };
        }
        sink.send_event(kind.refresh_event());
        true
    }

    /// Store a pushed credential. Returns whether a usable token is now held.
    ///
    /// A grant with no remaining lifetime is not stored and schedules no
    /// refresh, so an exhausted server-side limit is not hammered.
    pub fn on_update(&mut self, kind: CredentialKind, grant: TokenGrant, now: Instant) -> bool {
        let slot = self.slot_mut(kind);
        if grant.time_left <= 0.0 || !grant.time_left.is_finite() {
            info!(
                credential = kind.as_str(),
                time_left = grant.time_left,
                "Discarding credential without remaining lifetime"
            );
            slot.state = CredentialState::Absent;
            self.publish(kind, now);
            return false;
        }

        let expires_at = now + Duration::from_secs_f64(grant.time_left);
        info!(
            credential = slot.kind.as_str(),
            time_left = grant.time_left,
            "Credential updated"
        );
        slot.state = CredentialState::Held {
            token: grant.token,
            expires_at,
        };
        self.publish(kind, now);
        true
    }

    /// Earliest moment a held credential expires
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.playback.deadline(), self.search.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Clear every expired credential and request its replacement.
    /// Returns the kinds that expired.
    pub fn poll_expired(&mut self, sink: &dyn EventSink, now: Instant) -> Vec<CredentialKind> {
        let mut expired = Vec::new();
        for kind in [CredentialKind::Playback, CredentialKind::Search] {
            let due = matches!(self.slot(kind).deadline(), Some(at) if at <= now);
            if !due {
                continue;
            }
            info!(credential = kind.as_str(), "Credential expired, requesting refresh");
            self.slot_mut(kind).state = CredentialState::Absent;
            self.publish(kind, now);
            self.request(kind, sink, now);
            expired.push(kind);
        }
        expired
    }

    /// Allow the next reauthorization signal to start an interactive flow
    pub fn arm_reauthorization(&mut self) {
        self.reauth_armed = true;
    }

    /// Consume a reauthorization signal. Returns true when a flow should be
    /// started: the signal was armed and no flow is running.
    pub fn take_reauthorization(&mut self) -> bool {
        // The server answered the outstanding playback request with a
        // reauthorization demand instead of a token.
        if let CredentialState::Requested { .. } = self.playback.state {
            self.playback.state = CredentialState::Absent;
        }
        if !self.reauth_armed || self.reauth_in_flight {
            return false;
        }
        self.reauth_armed = false;
        self.reauth_in_flight = true;
        true
    }

    /// The interactive flow finished; request a fresh playback credential
    pub fn complete_reauthorization(&mut self, sink: &dyn EventSink, now: Instant) {
        self.reauth_in_flight = false;
        self.request(CredentialKind::Playback, sink, now);
    }

    pub fn reauthorization_in_flight(&self) -> bool {
        self.reauth_in_flight
    }
}
