//! Mutual authentication handshake, gateway side
//!
//! Seven stages run strictly in order. Each one follows the same pattern:
//!
//! 1. write the stage selector to `WRITE_DATA_INDICATION`
//! 2. frame our parameter and write it chunk by chunk to `WRITE_DATA_PARAM_VALUE`
//! 3. read `EDGE_PARAM_VALUE` until the edge's frame is complete
//! 4. check what the edge sent
//!
//! Stages 4 and 6 additionally wait for the edge's own verdict on
//! `GATEWAY_STATUS` before moving on. Every operation is requested through
//! the outbox and the machine only moves when the matching completion is fed
//! back in, so a single command is ever outstanding per step.
//!
//! | stage | gateway sends | gateway checks |
//! |-------|---------------|----------------|
//! | 1 | certificate (DER) | edge certificate chains to the pinned root |
//! | 2 | identity public key | edge key equals its certificate key |
//! | 3 | 16-byte nonce | (signs the edge nonce) |
//! | 4 | signature over edge nonce | edge signature over our nonce |
//! | 5 | ephemeral ECDH key | (stores edge ECDH key) |
//! | 6 | signature over our ECDH key | edge signature over its ECDH key |
//! | 7 | SHA-256 of the ECDH secret | edge hash matches ours |

use std::collections::VecDeque;
use std::sync::Arc;

use rand::RngCore;
use uuid::Uuid;
use zeroize::Zeroizing;

use gatelink_crypto::{EcdhKeyPair, PeerKey, SharedSecret, cert, sha256, wire};
use gatelink_proto::gatt::{self, status};
use gatelink_proto::{ProtocolError, ReassemblyBuffer, ReassemblyState, frame};

use crate::link::PendingCommand;
use crate::{Credentials, LinkError};

pub const NONCE_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStage {
    AwaitStart,
    Certificate,
    PublicKey,
    RandomNumber,
    Signature,
    EcdhPublicKey,
    EcdhSignature,
    SecretConfirm,
    Established,
    Failed(FailureReason),
}

impl HandshakeStage {
    /// 1 through 7 for the exchange stages
    pub fn number(&self) -> Option<u8> {
        match self {
            HandshakeStage::Certificate => Some(gatt::stage::CERTIFICATE),
            HandshakeStage::PublicKey => Some(gatt::stage::PUBLIC_KEY),
            HandshakeStage::RandomNumber => Some(gatt::stage::RANDOM_NUMBER),
            HandshakeStage::Signature => Some(gatt::stage::SIGNATURE),
            HandshakeStage::EcdhPublicKey => Some(gatt::stage::ECDH_PUBLIC_KEY),
            HandshakeStage::EcdhSignature => Some(gatt::stage::ECDH_SIGNATURE),
            HandshakeStage::SecretConfirm => Some(gatt::stage::SECRET_CONFIRM),
            _ => None,
        }
    }

    fn next(&self) -> Self {
        match self {
            HandshakeStage::AwaitStart => HandshakeStage::Certificate,
            HandshakeStage::Certificate => HandshakeStage::PublicKey,
            HandshakeStage::PublicKey => HandshakeStage::RandomNumber,
            HandshakeStage::RandomNumber => HandshakeStage::Signature,
            HandshakeStage::Signature => HandshakeStage::EcdhPublicKey,
            HandshakeStage::EcdhPublicKey => HandshakeStage::EcdhSignature,
            HandshakeStage::EcdhSignature => HandshakeStage::SecretConfirm,
            HandshakeStage::SecretConfirm => HandshakeStage::Established,
            other => other.clone(),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.number().is_some()
    }
}

/// Why an attempt ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("edge parameter CRC not matched")]
    CrcMismatch,

    #[error("edge certificate verification failed: {0}")]
    CertVerification(String),

    #[error("edge public key does not match its certificate")]
    PublicKeyMismatch,

    #[error("ECDSA signature verification failed")]
    SignatureVerification,

    #[error("ECDH signature verification failed")]
    EcdhSignatureVerification,

    #[error("ECDH secret hash did not match")]
    SecretMismatch,

    #[error("edge rejected the handshake with status {0:#04x}")]
    PeerRejected(u8),

    #[error("bad handshake parameter: {0}")]
    Parameter(String),

    #[error("edge parameter stream is malformed: {0}")]
    Protocol(ProtocolError),

    #[error("link failure during handshake: {0}")]
    Link(LinkError),

    #[error("mutual authentication service not found")]
    ServiceNotFound,
}

impl FailureReason {
    /// Numeric code for callers. Verdicts share the firmware status values,
    /// local-only failures start at 0x100.
    pub fn code(&self) -> u16 {
        match self {
            FailureReason::CertVerification(_) => status::CERTIFICATE_VERIFY_FAIL as u16,
            FailureReason::SignatureVerification => status::SIGNATURE_VERIFY_FAIL as u16,
            FailureReason::EcdhSignatureVerification => status::ECDH_SIGNATURE_FAIL as u16,
            FailureReason::SecretMismatch => status::SECRET_MISMATCH as u16,
            FailureReason::PublicKeyMismatch => status::PUBLIC_KEY_EXTRACT_FAIL as u16,
            FailureReason::CrcMismatch => status::TOKEN_CRC_FAIL as u16,
            FailureReason::PeerRejected(code) => *code as u16,
            FailureReason::Parameter(_) => 0x100,
            FailureReason::Protocol(_) => 0x101,
            FailureReason::Link(_) => 0x102,
            FailureReason::ServiceNotFound => 0x103,
        }
    }

    pub fn message(&self) -> String {
        match self {
            FailureReason::PeerRejected(code) => {
                format!("edge reported: {}", status::describe(*code))
            }
            other => other.to_string(),
        }
    }
}

/// Per-attempt secrets and peer material.
///
/// The gateway's long-lived identity lives in [`Credentials`]; everything here
/// is discarded on failure, reset or disconnect. Secrets zero themselves on drop.
#[derive(Default)]
pub struct KeyMaterial {
    peer_certificate: Option<Vec<u8>>,
    peer_identity: Option<PeerKey>,
    own_nonce: Option<[u8; NONCE_LEN]>,
    nonce_signature: Option<Vec<u8>>,
    ecdh: Option<EcdhKeyPair>,
    peer_ecdh: Option<[u8; wire::POINT_LEN]>,
    shared_secret_raw: Option<SharedSecret>,
    shared_secret_hash: Option<Zeroizing<[u8; 32]>>,
}

impl KeyMaterial {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.peer_identity.is_none()
            && self.own_nonce.is_none()
            && self.ecdh.is_none()
            && self.shared_secret_raw.is_none()
    }

    pub fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_certificate.as_deref()
    }

    pub fn peer_identity(&self) -> Option<&PeerKey> {
        self.peer_identity.as_ref()
    }

    pub fn ecdh_public_key(&self) -> Option<&[u8; wire::POINT_LEN]> {
        self.ecdh.as_ref().map(EcdhKeyPair::public_key)
    }

    pub fn shared_secret_raw(&self) -> Option<&[u8]> {
        self.shared_secret_raw.as_ref().map(|s| &s[..])
    }

    pub fn shared_secret_hash(&self) -> Option<&[u8; 32]> {
        self.shared_secret_hash.as_deref()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("peer_identity", &self.peer_identity.is_some())
            .field("ecdh", &self.ecdh.is_some())
            .field("shared_secret", &self.shared_secret_raw.is_some())
            .finish()
    }
}

#[derive(Debug)]
enum Step {
    Idle,
    Indicating,
    Sending(VecDeque<Vec<u8>>),
    Reading,
    AwaitingStatus,
}

pub struct HandshakeStateMachine {
    stage: HandshakeStage,
    step: Step,
    credentials: Arc<Credentials>,
    keys: KeyMaterial,
    param: ReassemblyBuffer,
    chunk_size: usize,
    outbox: Vec<PendingCommand>,
}

impl HandshakeStateMachine {
    pub fn new(credentials: Arc<Credentials>, chunk_size: usize) -> Self {
        Self {
            stage: HandshakeStage::AwaitStart,
            step: Step::Idle,
            credentials,
            keys: KeyMaterial::default(),
            param: ReassemblyBuffer::length_prefixed(),
            chunk_size,
            outbox: Vec::new(),
        }
    }

    pub fn stage(&self) -> &HandshakeStage {
        &self.stage
    }

    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    /// Commands requested since the last call
    pub fn take_commands(&mut self) -> Vec<PendingCommand> {
        std::mem::take(&mut self.outbox)
    }

    /// Begin a fresh attempt at stage 1, discarding any previous material
    pub fn start(&mut self) {
        self.reset();
        self.advance();
    }

    /// Back to `AwaitStart` with nothing retained
    pub fn reset(&mut self) {
        self.stage = HandshakeStage::AwaitStart;
        self.step = Step::Idle;
        self.keys.clear();
        self.param.reset();
        self.outbox.clear();
    }

    pub fn on_written(&mut self, characteristic: Uuid) {
        if characteristic == gatt::EDGE_STATUS {
            return;
        }

        match &mut self.step {
            Step::Indicating if characteristic == gatt::WRITE_DATA_INDICATION => {
                self.send_parameter();
            }
            Step::Sending(rest) if characteristic == gatt::WRITE_DATA_PARAM_VALUE => {
                match rest.pop_front() {
                    Some(chunk) => self.outbox.push(param_write(chunk)),
                    None => {
                        self.step = Step::Reading;
                        self.param.begin();
                        self.outbox.push(param_read());
                    }
                }
            }
            _ => log::debug!(
                "ignoring write completion on {characteristic} during {:?}",
                self.stage
            ),
        }
    }

    pub fn on_read(&mut self, characteristic: Uuid, value: &[u8]) {
        if characteristic == gatt::EDGE_PARAM_VALUE {
            self.on_param_chunk(value);
        } else if characteristic == gatt::GATEWAY_STATUS {
            self.on_gateway_status(value, false);
        } else {
            log::debug!("ignoring read of {characteristic} during {:?}", self.stage);
        }
    }

    pub fn on_notification(&mut self, characteristic: Uuid, value: &[u8]) {
        if characteristic == gatt::GATEWAY_STATUS {
            self.on_gateway_status(value, true);
        }
    }

    /// A handshake command ran out of retries
    pub fn on_link_failure(&mut self, command: &PendingCommand, error: LinkError) {
        if !self.stage.in_progress()
            || command.service != gatt::MUTUAL_AUTH_SERVICE
            || command.characteristic == gatt::EDGE_STATUS
        {
            return;
        }
        self.fail(FailureReason::Link(error));
    }

    /// Abort from outside, e.g. when the service is missing
    pub fn abort(&mut self, reason: FailureReason) {
        self.fail(reason);
    }

    fn advance(&mut self) {
        self.stage = self.stage.next();
        self.param.reset();
        match self.stage.number() {
            Some(selector) => {
                log::info!("handshake stage {selector}: {:?}", self.stage);
                self.step = Step::Indicating;
                self.outbox.push(PendingCommand::write(
                    gatt::MUTUAL_AUTH_SERVICE,
                    gatt::WRITE_DATA_INDICATION,
                    vec![selector],
                ));
            }
            None => {
                log::info!("handshake reached {:?}", self.stage);
                self.step = Step::Idle;
            }
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        log::warn!("handshake failed during {:?}: {reason}", self.stage);
        self.stage = HandshakeStage::Failed(reason);
        self.step = Step::Idle;
        self.keys.clear();
        self.param.reset();
    }

    fn edge_status(&mut self, code: u8) {
        self.outbox.push(PendingCommand::write(
            gatt::MUTUAL_AUTH_SERVICE,
            gatt::EDGE_STATUS,
            vec![code],
        ));
    }

    fn send_parameter(&mut self) {
        let payload = match self.outgoing_parameter() {
            Ok(payload) => payload,
            Err(reason) => return self.fail(reason),
        };
        let framed = match frame::encode(&payload) {
            Ok(framed) => framed,
            Err(e) => return self.fail(FailureReason::Parameter(e.to_string())),
        };
        log::debug!(
            "stage {:?}: sending {} byte parameter",
            self.stage.number(),
            payload.len()
        );

        let mut chunks: VecDeque<Vec<u8>> = gatelink_proto::split(&framed, self.chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        match chunks.pop_front() {
            Some(first) => {
                self.outbox.push(param_write(first));
                self.step = Step::Sending(chunks);
            }
            None => self.fail(FailureReason::Parameter("empty frame".into())),
        }
    }

    fn outgoing_parameter(&mut self) -> Result<Vec<u8>, FailureReason> {
        let missing = |what: &str| FailureReason::Parameter(format!("{what} not available"));
        match self.stage {
            HandshakeStage::Certificate => Ok(self.credentials.certificate.clone()),
            HandshakeStage::PublicKey => Ok(self.credentials.identity.public_key().to_vec()),
            HandshakeStage::RandomNumber => {
                let mut nonce = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                self.keys.own_nonce = Some(nonce);
                Ok(nonce.to_vec())
            }
            HandshakeStage::Signature => {
                let der = self
                    .keys
                    .nonce_signature
                    .as_deref()
                    .ok_or_else(|| missing("nonce signature"))?;
                strip(der)
            }
            HandshakeStage::EcdhPublicKey => {
                let pair = EcdhKeyPair::generate();
                let point = pair.public_key().to_vec();
                self.keys.ecdh = Some(pair);
                Ok(point)
            }
            HandshakeStage::EcdhSignature => {
                let point = self
                    .keys
                    .ecdh_public_key()
                    .ok_or_else(|| missing("ECDH key"))?;
                let der = self
                    .credentials
                    .identity
                    .sign(point)
                    .map_err(|e| FailureReason::Parameter(e.to_string()))?;
                strip(&der)
            }
            HandshakeStage::SecretConfirm => self
                .keys
                .shared_secret_hash()
                .map(|hash| hash.to_vec())
                .ok_or_else(|| missing("secret hash")),
            _ => Err(missing("stage parameter")),
        }
    }

    fn on_param_chunk(&mut self, chunk: &[u8]) {
        match self.param.feed(chunk) {
            Err(ProtocolError::NoActiveRead) => {
                log::warn!("dropping {} byte edge chunk with no active read", chunk.len());
            }
            Err(e) => self.fail(FailureReason::Protocol(e)),
            Ok(ReassemblyState::NeedMore) => self.outbox.push(param_read()),
            Ok(ReassemblyState::Complete(body)) => match frame::decode_body(&body) {
                Ok(decoded) if decoded.crc_ok => {
                    log::debug!(
                        "stage {:?}: received {} byte edge parameter",
                        self.stage.number(),
                        decoded.payload.len()
                    );
                    self.step = Step::Idle;
                    self.interpret(decoded.payload);
                }
                Ok(_) => self.fail(FailureReason::CrcMismatch),
                Err(e) => self.fail(FailureReason::Parameter(e.to_string())),
            },
        }
    }

    fn interpret(&mut self, payload: Vec<u8>) {
        match self.stage {
            HandshakeStage::Certificate => {
                match cert::verify_peer(&payload, &self.credentials.root_ca) {
                    Ok(key) => {
                        log::info!("edge certificate verified");
                        self.keys.peer_identity = Some(key);
                        self.keys.peer_certificate = Some(payload);
                        self.advance();
                    }
                    Err(e) => self.fail(FailureReason::CertVerification(e.to_string())),
                }
            }
            HandshakeStage::PublicKey => match PeerKey::from_bytes(&payload) {
                Ok(key) if Some(&key) == self.keys.peer_identity.as_ref() => self.advance(),
                Ok(_) => self.fail(FailureReason::PublicKeyMismatch),
                Err(e) => self.fail(FailureReason::Parameter(e.to_string())),
            },
            HandshakeStage::RandomNumber => {
                match self.credentials.identity.sign(&payload) {
                    Ok(signature) => {
                        self.keys.nonce_signature = Some(signature);
                        self.advance();
                    }
                    Err(e) => self.fail(FailureReason::Parameter(e.to_string())),
                }
            }
            HandshakeStage::Signature => {
                let verified = match (&self.keys.own_nonce, &self.keys.peer_identity) {
                    (Some(nonce), Some(peer)) => wire::attach_signature_header(&payload)
                        .map(|der| peer.verify(nonce, &der))
                        .unwrap_or(false),
                    _ => false,
                };
                if verified {
                    log::info!("edge signature over our nonce verified");
                    self.edge_status(status::SIGNATURE_VERIFY_PASS);
                    self.await_gateway_status();
                } else {
                    self.edge_status(status::SIGNATURE_VERIFY_FAIL);
                    self.fail(FailureReason::SignatureVerification);
                }
            }
            HandshakeStage::EcdhPublicKey => match PeerKey::from_bytes(&payload) {
                Ok(key) => {
                    self.keys.peer_ecdh = Some(*key.point());
                    self.advance();
                }
                Err(e) => self.fail(FailureReason::Parameter(e.to_string())),
            },
            HandshakeStage::EcdhSignature => {
                let verified = match (&self.keys.peer_ecdh, &self.keys.peer_identity) {
                    (Some(point), Some(peer)) => wire::attach_signature_header(&payload)
                        .map(|der| peer.verify(point, &der))
                        .unwrap_or(false),
                    _ => false,
                };
                if verified {
                    log::info!("edge ECDH signature verified");
                    self.await_gateway_status();
                } else {
                    self.edge_status(status::ECDH_SIGNATURE_FAIL);
                    self.fail(FailureReason::EcdhSignatureVerification);
                }
            }
            HandshakeStage::SecretConfirm => {
                let matched = self
                    .keys
                    .shared_secret_hash()
                    .is_some_and(|hash| hash[..] == payload[..]);
                if matched {
                    self.edge_status(status::SECRET_MATCH);
                    self.advance();
                } else {
                    self.edge_status(status::SECRET_MISMATCH);
                    self.fail(FailureReason::SecretMismatch);
                }
            }
            _ => log::debug!("ignoring edge parameter during {:?}", self.stage),
        }
    }

    fn await_gateway_status(&mut self) {
        self.step = Step::AwaitingStatus;
        self.outbox.push(PendingCommand::read(
            gatt::MUTUAL_AUTH_SERVICE,
            gatt::GATEWAY_STATUS,
        ));
    }

    fn on_gateway_status(&mut self, value: &[u8], notified: bool) {
        let Some(&code) = value.first() else {
            log::warn!("empty gateway status");
            return;
        };
        if !self.stage.in_progress() {
            log::debug!("gateway status {code:#04x} outside the handshake");
            return;
        }
        if !status::is_success(code) {
            return self.fail(FailureReason::PeerRejected(code));
        }
        if !matches!(self.step, Step::AwaitingStatus) {
            log::debug!("gateway status {code:#04x}: {}", status::describe(code));
            return;
        }

        match (&self.stage, code) {
            (HandshakeStage::Signature, status::SIGNATURE_VERIFY_PASS) => self.advance(),
            (HandshakeStage::EcdhSignature, status::ECDH_SIGNATURE_PASS) => self.derive_secret(),
            // a stale notification from an earlier stage
            _ if notified => {}
            _ => self.fail(FailureReason::PeerRejected(code)),
        }
    }

    fn derive_secret(&mut self) {
        self.edge_status(status::ECDH_SIGNATURE_PASS);

        let agreed = match (&self.keys.ecdh, &self.keys.peer_ecdh) {
            (Some(pair), Some(peer)) => pair.agree(peer),
            _ => return self.fail(FailureReason::Parameter("ECDH material missing".into())),
        };
        match agreed {
            Ok(raw) => {
                let hash = Zeroizing::new(sha256(&raw[..]));
                log::info!(
                    "session key derived, hash {}..",
                    data_encoding::HEXLOWER.encode(&hash[..4])
                );
                self.keys.shared_secret_raw = Some(raw);
                self.keys.shared_secret_hash = Some(hash);
                self.edge_status(status::SESSION_KEY_GENERATED);
                self.advance();
            }
            Err(e) => self.fail(FailureReason::Parameter(e.to_string())),
        }
    }
}

fn strip(der: &[u8]) -> Result<Vec<u8>, FailureReason> {
    wire::strip_signature_header(der)
        .map(<[u8]>::to_vec)
        .map_err(|e| FailureReason::Parameter(e.to_string()))
}

fn param_write(chunk: Vec<u8>) -> PendingCommand {
    PendingCommand::write(gatt::MUTUAL_AUTH_SERVICE, gatt::WRITE_DATA_PARAM_VALUE, chunk)
}

fn param_read() -> PendingCommand {
    PendingCommand::read(gatt::MUTUAL_AUTH_SERVICE, gatt::EDGE_PARAM_VALUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Operation;
    use gatelink_crypto::IdentityKeys;
    use std::time::Duration;

    const YEAR: Duration = Duration::from_secs(365 * 24 * 3600);

    struct Pki {
        root_keys: IdentityKeys,
        root_der: Vec<u8>,
    }

    impl Pki {
        fn new() -> Self {
            let root_keys = IdentityKeys::generate();
            let root_der =
                cert::issue("Root", root_keys.public_key(), "Root", &root_keys, 1, YEAR).unwrap();
            Self { root_keys, root_der }
        }

        fn leaf(&self, name: &str, keys: &IdentityKeys) -> Vec<u8> {
            cert::issue(name, keys.public_key(), "Root", &self.root_keys, 2, YEAR).unwrap()
        }

        fn machine(&self) -> HandshakeStateMachine {
            let identity = IdentityKeys::generate();
            let certificate = self.leaf("gateway", &identity);
            let credentials = Credentials::new(identity, certificate, self.root_der.clone());
            HandshakeStateMachine::new(Arc::new(credentials), 20)
        }
    }

    /// Acknowledge writes until the machine asks for the edge parameter,
    /// returning everything written to WRITE_DATA_PARAM_VALUE
    fn send_all(machine: &mut HandshakeStateMachine) -> Vec<u8> {
        let mut sent = Vec::new();
        loop {
            let commands = machine.take_commands();
            assert_eq!(commands.len(), 1, "one command per completion");
            let command = &commands[0];
            match command.operation {
                Operation::Write => {
                    if command.characteristic == gatt::WRITE_DATA_PARAM_VALUE {
                        let chunk = command.payload.as_ref().unwrap();
                        assert!(chunk.len() <= 20);
                        sent.extend_from_slice(chunk);
                    }
                    machine.on_written(command.characteristic);
                }
                Operation::Read => {
                    assert_eq!(command.characteristic, gatt::EDGE_PARAM_VALUE);
                    return sent;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn stage_one_sends_framed_certificate() {
        let pki = Pki::new();
        let mut machine = pki.machine();
        machine.start();

        assert_eq!(machine.stage(), &HandshakeStage::Certificate);
        let first = machine.take_commands();
        assert_eq!(first[0].characteristic, gatt::WRITE_DATA_INDICATION);
        assert_eq!(first[0].payload, Some(vec![gatt::stage::CERTIFICATE]));
        machine.on_written(gatt::WRITE_DATA_INDICATION);

        let sent = send_all(&mut machine);
        let decoded = frame::decode(&sent).unwrap();
        assert!(decoded.crc_ok);
        assert_eq!(decoded.payload, machine.credentials.certificate);
    }

    #[test]
    fn valid_edge_certificate_advances() {
        let pki = Pki::new();
        let mut machine = pki.machine();
        let edge = IdentityKeys::generate();
        let edge_cert = frame::encode(&pki.leaf("edge", &edge)).unwrap();

        machine.start();
        machine.take_commands();
        machine.on_written(gatt::WRITE_DATA_INDICATION);
        send_all(&mut machine);

        let mut chunks = edge_cert.chunks(20).peekable();
        while let Some(chunk) = chunks.next() {
            machine.on_read(gatt::EDGE_PARAM_VALUE, chunk);
            let next = machine.take_commands();
            if chunks.peek().is_some() {
                assert_eq!(next, vec![param_read()]);
            } else {
                assert_eq!(next[0].payload, Some(vec![gatt::stage::PUBLIC_KEY]));
            }
        }
        assert_eq!(machine.stage(), &HandshakeStage::PublicKey);
        assert_eq!(machine.keys().peer_identity().unwrap().point(), edge.public_key());
    }

    #[test]
    fn corrupted_edge_frame_fails_with_crc() {
        let pki = Pki::new();
        let mut machine = pki.machine();
        machine.start();
        machine.take_commands();
        machine.on_written(gatt::WRITE_DATA_INDICATION);
        send_all(&mut machine);

        let mut framed = frame::encode(b"not a certificate").unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0xff;
        machine.on_read(gatt::EDGE_PARAM_VALUE, &framed);

        assert_eq!(machine.stage(), &HandshakeStage::Failed(FailureReason::CrcMismatch));
        assert!(machine.keys().is_empty());
    }

    #[test]
    fn certificate_from_another_root_is_rejected() {
        let pki = Pki::new();
        let stranger = Pki::new();
        let mut machine = pki.machine();
        let edge = IdentityKeys::generate();

        machine.start();
        machine.take_commands();
        machine.on_written(gatt::WRITE_DATA_INDICATION);
        send_all(&mut machine);
        machine.on_read(
            gatt::EDGE_PARAM_VALUE,
            &frame::encode(&stranger.leaf("edge", &edge)).unwrap(),
        );

        match machine.stage() {
            HandshakeStage::Failed(reason @ FailureReason::CertVerification(_)) => {
                assert_eq!(reason.code(), status::CERTIFICATE_VERIFY_FAIL as u16);
            }
            other => panic!("unexpected stage {other:?}"),
        }
    }

    #[test]
    fn failure_status_from_edge_aborts() {
        let pki = Pki::new();
        let mut machine = pki.machine();

        // nothing to abort yet
        machine.on_notification(gatt::GATEWAY_STATUS, &[status::CERTIFICATE_VERIFY_FAIL]);
        assert_eq!(machine.stage(), &HandshakeStage::AwaitStart);

        machine.start();
        machine.on_notification(gatt::GATEWAY_STATUS, &[status::CERTIFICATE_VERIFY_PASS]);
        assert_eq!(machine.stage(), &HandshakeStage::Certificate);

        machine.on_notification(gatt::GATEWAY_STATUS, &[status::CERTIFICATE_VERIFY_FAIL]);
        let HandshakeStage::Failed(reason) = machine.stage() else {
            panic!("handshake should have failed");
        };
        assert_eq!(reason, &FailureReason::PeerRejected(status::CERTIFICATE_VERIFY_FAIL));
        assert_eq!(reason.code(), 0x02);
        assert!(reason.message().contains("gateway certificate verification failed"));
    }

    #[test]
    fn link_failure_only_counts_for_auth_commands() {
        let pki = Pki::new();
        let mut machine = pki.machine();
        machine.start();

        let info = PendingCommand::read(gatt::DEVICE_INFO_SERVICE, gatt::MTU);
        machine.on_link_failure(&info, LinkError::Timeout(gatt::MTU));
        assert_eq!(machine.stage(), &HandshakeStage::Certificate);

        let status_write =
            PendingCommand::write(gatt::MUTUAL_AUTH_SERVICE, gatt::EDGE_STATUS, vec![0x03]);
        machine.on_link_failure(&status_write, LinkError::Disconnected);
        assert_eq!(machine.stage(), &HandshakeStage::Certificate);

        let indication = PendingCommand::write(
            gatt::MUTUAL_AUTH_SERVICE,
            gatt::WRITE_DATA_INDICATION,
            vec![1],
        );
        machine.on_link_failure(&indication, LinkError::Timeout(gatt::WRITE_DATA_INDICATION));
        assert_eq!(
            machine.stage(),
            &HandshakeStage::Failed(FailureReason::Link(LinkError::Timeout(
                gatt::WRITE_DATA_INDICATION
            )))
        );
        assert_eq!(machine.stage().number(), None);
    }

    #[test]
    fn stray_param_chunk_is_dropped() {
        let pki = Pki::new();
        let mut machine = pki.machine();
        machine.start();
        machine.take_commands();

        machine.on_read(gatt::EDGE_PARAM_VALUE, &[0x00, 0x10, 0xaa]);
        assert_eq!(machine.stage(), &HandshakeStage::Certificate);
        assert!(machine.take_commands().is_empty());
    }
}
