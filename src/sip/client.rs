/// SIP registration client
///
/// Keeps one account registered with the upstream registrar and watches
/// the same socket for inbound INVITEs, recording each observed call.
/// Requests are strictly serialized: a single pending-response slot is
/// paired with the next inbound response, so correlation never needs to
/// match Via branches.

use anyhow::{Context, Result};
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{self, Headers, SipMessage};
use super::digest::DigestChallenge;
use super::transport::SipTransport;
use crate::config::Config;
use crate::sentinel::Sentinel;
use crate::sink::CallSink;

/// How long a sent request may wait for its response
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Time to wait before re-registering if an error occurred
pub const ERROR_WAIT: u64 = 30;

/// Refresh cycles served by one socket before it is re-cycled
/// (guards against stale Via addresses and server-side binding drift)
const MAX_REFRESH_CYCLES: u32 = 20;

/// Delay before the next REGISTER after a success with `Expires: N`
pub fn refresh_delay(expires: u64) -> u64 {
    expires.saturating_sub(1).max(10)
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("timed out waiting for response")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("send failed: {0}")]
    Send(#[from] io::Error),
}

/// Registration lifecycle; only the controller loop mutates this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Disconnected,
    Connecting,
    Challenging,
    Authenticated,
    Refreshing,
    Terminating,
    Terminated,
}

/// A paired-up response, as seen by `request()`
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status: u16,
    pub headers: Headers,
}

/// Bounded insertion-ordered cache of From headers already recorded.
///
/// The tag parameter in a From header is stable within a call but
/// changes between calls, so the raw header value keys one dialog.
#[derive(Debug, Default)]
pub struct DedupCache {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupCache {
    /// Hard cap on entries
    pub const CAPACITY: usize = 200;
    /// Entries kept (newest first) when the cap is hit
    const RETAIN: usize = 99;

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn insert(&mut self, key: &str) {
        if self.seen.contains(key) {
            return;
        }
        if self.order.len() >= Self::CAPACITY {
            while self.order.len() > Self::RETAIN {
                if let Some(evicted) = self.order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Handles inbound requests on the registration socket.
///
/// OPTIONS probes are keep-alives and ignored; INVITEs become call
/// records, deduplicated per dialog. No SIP response is ever sent: the
/// upstream treats the silence as a missed call and routes accordingly.
pub struct InviteObserver {
    cache: DedupCache,
    sink: Arc<dyn CallSink>,
}

impl InviteObserver {
    pub fn new(sink: Arc<dyn CallSink>) -> Self {
        Self {
            cache: DedupCache::default(),
            sink,
        }
    }

    pub fn handle_request(&mut self, msg: &SipMessage) {
        let SipMessage::Request { method, headers, .. } = msg else {
            return;
        };
        match method.as_str() {
            // keep-alive probe, don't care
            "OPTIONS" => {}
            "INVITE" => self.incoming_call(headers),
            other => warn!("unknown request: {}", other),
        }
    }

    fn incoming_call(&mut self, headers: &Headers) {
        let Some(from) = headers.get("From") else {
            warn!("INVITE without a From header");
            return;
        };
        if self.cache.contains(&from) {
            // retransmit within the same dialog
            return;
        }
        self.cache.insert(&from);

        let number = match codec::caller_number(&from) {
            Some(number) => number,
            None => {
                warn!("unable to find number in {:?}", from);
                "unknown".to_string()
            }
        };
        let brand = headers.get("X-Brand");
        match &brand {
            Some(brand) => info!("incoming call from {} ({})", number, brand),
            None => info!("incoming call from {}", number),
        }
        self.sink.record_call(&number, brand.as_deref());
    }
}

/// One open socket to the registrar plus its correlation state
struct Session {
    transport: SipTransport,
    local_ip: IpAddr,
    slot: Arc<Mutex<Option<oneshot::Sender<SipResponse>>>>,
    request_lock: tokio::sync::Mutex<()>,
}

pub struct SipClient {
    config: Arc<Config>,
    username: String,
    password: String,
    call_id: String,
    cseq: AtomicU32,
    state: RegistrationState,
    sentinel: Sentinel,
    observer: Arc<Mutex<InviteObserver>>,
}

impl SipClient {
    pub fn new(config: Arc<Config>, sink: Arc<dyn CallSink>) -> Result<Self> {
        anyhow::ensure!(
            config.register_expires > 0,
            "register_expires must be non-zero"
        );
        let (username, password) = config
            .credentials()
            .map(|(user, pass)| (user.to_string(), pass.to_string()))?;
        std::fs::create_dir_all(&config.cache_dir)
            .with_context(|| format!("failed to create cache dir {:?}", config.cache_dir))?;
        let call_id = load_caller_id(&config.cache_dir)?;
        let sentinel = Sentinel::new(config.sentinel_path());

        Ok(Self {
            config,
            username,
            password,
            call_id,
            cseq: AtomicU32::new(1),
            state: RegistrationState::Disconnected,
            sentinel,
            observer: Arc::new(Mutex::new(InviteObserver::new(sink))),
        })
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    fn set_state(&mut self, state: RegistrationState) {
        if self.state != state {
            debug!("registration state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Keep the account registered until `cancel` fires, then
    /// de-register once and close the socket.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        while !cancel.is_cancelled() {
            self.set_state(RegistrationState::Connecting);
            let session = match self.connect().await {
                Ok(session) => session,
                Err(e) => {
                    warn!("failed to open SIP socket: {:#}", e);
                    self.set_state(RegistrationState::Disconnected);
                    if !sleep_unless_cancelled(&cancel, ERROR_WAIT).await {
                        break;
                    }
                    continue;
                }
            };
            info!("connection established, local address {}", session.transport.local_addr());

            for cycle in 0..MAX_REFRESH_CYCLES {
                self.set_state(if cycle == 0 {
                    RegistrationState::Challenging
                } else {
                    RegistrationState::Refreshing
                });
                let delay = match self.register(&session, self.config.register_expires).await {
                    RegisterOutcome::Registered { refresh_in } => {
                        self.set_state(RegistrationState::Authenticated);
                        info!("re-registering in {} seconds", refresh_in);
                        refresh_in
                    }
                    RegisterOutcome::Backoff { wait } => {
                        info!("retrying REGISTER in {} seconds", wait);
                        wait
                    }
                    RegisterOutcome::Unregistered => unreachable!("expires > 0"),
                };
                if !sleep_unless_cancelled(&cancel, delay).await {
                    self.shutdown(session).await;
                    return Ok(());
                }
            }
            debug!("re-cycling SIP socket");
            session.transport.close();
        }
        self.set_state(RegistrationState::Terminated);
        Ok(())
    }

    async fn shutdown(&mut self, session: Session) {
        self.set_state(RegistrationState::Terminating);
        info!("un-registering...");
        // best effort: any outcome is accepted
        self.register(&session, 0).await;
        session.transport.close();
        self.set_state(RegistrationState::Terminated);
    }

    async fn connect(&self) -> Result<Session> {
        let server = format!("{}:{}", self.config.sip_host, self.config.sip_port);
        let slot: Arc<Mutex<Option<oneshot::Sender<SipResponse>>>> = Arc::new(Mutex::new(None));

        let dispatch_slot = slot.clone();
        let observer = self.observer.clone();
        let transport = SipTransport::open(&server, move |datagram| {
            dispatch_datagram(datagram, &dispatch_slot, &observer);
        })
        .await?;

        let local_ip = transport.local_addr().ip();
        Ok(Session {
            transport,
            local_ip,
            slot,
            request_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// One REGISTER handshake (challenge + authenticated retry).
    /// Returns what the controller should do next.
    async fn register(&self, session: &Session, expires: u64) -> RegisterOutcome {
        let local_ip = session.local_ip;
        let common_headers = self.common_headers(local_ip, expires);

        let r1 = match self
            .request(session, self.register_lines(local_ip, None, &common_headers))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("first REGISTER failed: {}", e);
                return RegisterOutcome::Backoff { wait: ERROR_WAIT };
            }
        };
        if r1.status != 401 {
            warn!("unexpected response to first REGISTER {} != 401", r1.status);
            return RegisterOutcome::Backoff { wait: retry_after(&r1.headers) };
        }

        let Some(challenge) = r1
            .headers
            .get("WWW-Authenticate")
            .as_deref()
            .and_then(DigestChallenge::parse)
        else {
            warn!("401 without a usable digest challenge");
            return RegisterOutcome::Backoff { wait: ERROR_WAIT };
        };
        let authorization =
            challenge.authorization(&self.username, &self.password, "REGISTER", &self.sip_uri());

        let r2 = match self
            .request(
                session,
                self.register_lines(local_ip, Some(&authorization), &common_headers),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("second REGISTER failed: {}", e);
                return RegisterOutcome::Backoff { wait: ERROR_WAIT };
            }
        };

        if expires == 0 {
            info!("un-registered, response: {}", r2.status);
            RegisterOutcome::Unregistered
        } else if r2.status != 200 {
            warn!("unexpected response to second REGISTER {} != 200", r2.status);
            RegisterOutcome::Backoff { wait: retry_after(&r2.headers) }
        } else {
            info!("successfully registered");
            if let Err(e) = self.sentinel.touch() {
                warn!("failed to update sentinel: {:#}", e);
            }
            RegisterOutcome::Registered { refresh_in: refresh_delay(expires) }
        }
    }

    fn register_lines(
        &self,
        local_ip: IpAddr,
        authorization: Option<&str>,
        common_headers: &[String],
    ) -> Vec<String> {
        let host = &self.config.sip_host;
        let port = self.config.sip_port;
        let mut lines = vec![
            format!("REGISTER sip:{}:{} SIP/2.0", host, port),
            format!(
                "Via: SIP/2.0/UDP {}:5060;rport;branch={}",
                local_ip,
                generate_branch(),
            ),
            format!("CSeq: {} REGISTER", self.cseq.load(Ordering::SeqCst)),
        ];
        if let Some(authorization) = authorization {
            lines.push(format!("Authorization: {}", authorization));
        }
        lines.extend_from_slice(common_headers);
        lines
    }

    /// The URI the digest response is computed over. The port position
    /// carries the account secret; the upstream registrar expects
    /// exactly this shape.
    fn sip_uri(&self) -> String {
        format!("sip:{}:{}", self.config.sip_host, self.password)
    }

    fn common_headers(&self, local_ip: IpAddr, expires: u64) -> Vec<String> {
        let user = &self.username;
        let host = &self.config.sip_host;
        let port = self.config.sip_port;
        vec![
            format!("From: <sip:{}@{}:{}>", user, host, port),
            format!("To: <sip:{}@{}:{}>", user, host, port),
            format!("Call-ID: {}", self.call_id),
            format!("Contact: <sip:{}@{}>", user, local_ip),
            format!("Expires: {}", expires),
            "Max-Forwards: 70".to_string(),
            "User-Agent: TutorCruncher Mithra".to_string(),
            "Content-Length: 0".to_string(),
        ]
    }

    /// Send one request and wait for the next response.
    ///
    /// Requests are serialized through a FIFO-fair mutex and correlated
    /// via a single-shot slot; the per-request budget is 10 seconds.
    async fn request(&self, session: &Session, lines: Vec<String>) -> Result<SipResponse, RequestError> {
        let _guard = session.request_lock.lock().await;

        let wire = lines.join("\r\n") + "\r\n\r\n";
        let (tx, rx) = oneshot::channel();
        *session.slot.lock().unwrap() = Some(tx);

        let result = async {
            session.transport.send(wire.as_bytes()).await?;
            self.cseq.fetch_add(1, Ordering::SeqCst);
            match timeout(REQUEST_TIMEOUT, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(RequestError::Cancelled),
                Err(_) => Err(RequestError::Timeout),
            }
        }
        .await;

        *session.slot.lock().unwrap() = None;
        result
    }
}

enum RegisterOutcome {
    Registered { refresh_in: u64 },
    Backoff { wait: u64 },
    Unregistered,
}

/// Route one inbound datagram: responses settle the pending slot,
/// requests go to the observer, anything unparseable is dropped.
fn dispatch_datagram(
    datagram: &[u8],
    slot: &Mutex<Option<oneshot::Sender<SipResponse>>>,
    observer: &Mutex<InviteObserver>,
) {
    if codec::is_keepalive(datagram) {
        // ping from server, ignore
        return;
    }
    let msg = match SipMessage::parse(datagram) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("error processing datagram: {}", e);
            return;
        }
    };
    match msg {
        SipMessage::Response { status, headers, .. } => {
            let pending = slot.lock().unwrap().take();
            match pending {
                Some(tx) => {
                    let _ = tx.send(SipResponse { status, headers });
                }
                None => warn!("no pending request for response: {}", status),
            }
        }
        request @ SipMessage::Request { .. } => {
            observer.lock().unwrap().handle_request(&request);
        }
    }
}

/// Retry-After from an error response, or the default error wait
fn retry_after(headers: &Headers) -> u64 {
    headers
        .get("Retry-After")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(ERROR_WAIT)
}

/// Branch parameter for the topmost Via
/// Must start with "z9hG4bK" per RFC 3261
pub fn generate_branch() -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("z9hG4bK{:016x}", random)
}

/// Load the persistent Caller-ID, generating one on first run.
///
/// The value is stable across restarts so the registrar sees one
/// binding rather than an ever-growing pile of them.
pub fn load_caller_id(cache_dir: &Path) -> Result<String> {
    let cache_file = cache_dir.join("caller_id.txt");
    match std::fs::read_to_string(&cache_file) {
        Ok(text) => {
            let call_id = text.trim_matches([' ', '\r', '\n']).to_string();
            info!("loaded Caller-ID from {:?}: {:?}", cache_file, call_id);
            Ok(call_id)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let random: [u8; 20] = rand::thread_rng().gen();
            let hex: String = random.iter().map(|b| format!("{:02x}", b)).collect();
            let call_id = format!("{}@mithra", hex);
            std::fs::write(&cache_file, format!("{}\n", call_id))
                .with_context(|| format!("failed to write {:?}", cache_file))?;
            info!("generated new Caller-ID: {:?}, saved to {:?}", call_id, cache_file);
            Ok(call_id)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {:?}", cache_file)),
    }
}

async fn sleep_unless_cancelled(cancel: &CancellationToken, secs: u64) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(Duration::from_secs(secs)) => true,
    }
}
