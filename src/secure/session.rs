//! KNX IP Secure unicast session.
//!
//! [`SecureSession`] decorates another [`AsyncTransport`] (normally a TCP
//! stream): every frame handed to `send_to` leaves wrapped in a
//! `SECURE_WRAPPER`, and `recv_from` hands back only frames whose MAC and
//! sequence number check out. The tunnel state machine above never sees
//! the cryptography.
//!
//! ## Handshake
//!
//! ```text
//! client                                   server
//!   │ SESSION_REQUEST (client public key)    │
//!   │ ─────────────────────────────────────> │
//!   │ SESSION_RESPONSE (id, server key, MAC) │
//!   │ <───────────────────────────────────── │
//!   │ WRAPPER(SESSION_AUTHENTICATE)          │
//!   │ ─────────────────────────────────────> │
//!   │ WRAPPER(SESSION_STATUS success)        │
//!   │ <───────────────────────────────────── │
//! ```

use crate::error::{KnxError, Result};
use crate::net::transport::{AsyncTransport, TransportFactory, TransportProtocol};
use crate::protocol::constants::{SecureSessionStatus, CONNECT_REQUEST_TIMEOUT, MAX_FRAME_SIZE};
use crate::protocol::frame::{Hpai, KnxIpFrame};
use crate::protocol::secure_services::{SessionAuthenticate, SessionRequest, SessionStatus};
use crate::secure::primitives::{
    cbc_mac, ctr, generate_key_pair, macs_equal, session_key, xor, Key,
};
use crate::secure::wrapper::{open, seal, sequence_bytes, sequence_value};
use async_trait::async_trait;
use core::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use x25519_dalek::{PublicKey, StaticSecret};

/// Serial number sent when none is configured
pub const DEFAULT_SERIAL_NUMBER: [u8; 6] = [0x00, 0xFA, 0x12, 0x34, 0x56, 0x78];

/// A session is kept alive after this much send silence.
pub const SESSION_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(50);

const COUNTER_0_HANDSHAKE: [u8; 16] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0x00,
];

/// Key material and identity for one secure tunnel.
#[derive(Clone)]
pub struct SessionCredentials {
    /// User id (1 is the management user, 2.. are tunnels)
    pub user_id: u8,
    /// PBKDF2 hash of the user password
    pub user_password_key: Key,
    /// PBKDF2 hash of the device authentication code. Without it the
    /// server's session response is accepted unverified.
    pub device_authentication_key: Option<Key>,
    /// Our serial number in wrapper headers
    pub serial_number: [u8; 6],
    /// Message tag in wrapper headers
    pub message_tag: u16,
}

impl SessionCredentials {
    /// Credentials with the default serial number and tag 0.
    pub fn new(user_id: u8, user_password_key: Key) -> Self {
        Self {
            user_id,
            user_password_key,
            device_authentication_key: None,
            serial_number: DEFAULT_SERIAL_NUMBER,
            message_tag: 0,
        }
    }

    /// Verify the session response with this device authentication key.
    #[must_use]
    pub fn with_device_authentication(mut self, key: Key) -> Self {
        self.device_authentication_key = Some(key);
        self
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("user_id", &self.user_id)
            .field("serial_number", &self.serial_number)
            .field("message_tag", &self.message_tag)
            .finish_non_exhaustive()
    }
}

/// Sequence-tracking wrapper codec for one session.
///
/// Both ends of a session use the same shape: a counter for what we send
/// and the last sequence accepted from the peer.
#[derive(Clone)]
pub struct SessionCipher {
    key: Key,
    session_id: u16,
    serial_number: [u8; 6],
    message_tag: u16,
    send_sequence: u64,
    last_received: Option<u64>,
}

impl SessionCipher {
    /// Cipher for session `session_id` keyed with the ECDH session key.
    pub fn new(key: Key, session_id: u16, serial_number: [u8; 6], message_tag: u16) -> Self {
        Self {
            key,
            session_id,
            serial_number,
            message_tag,
            send_sequence: 0,
            last_received: None,
        }
    }

    /// Session identifier
    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    /// Wrap one frame and advance the send sequence.
    pub fn wrap(&mut self, frame: &[u8]) -> KnxIpFrame {
        let wrapper = seal(
            &self.key,
            self.session_id,
            sequence_bytes(self.send_sequence),
            self.serial_number,
            self.message_tag,
            frame,
        );
        self.send_sequence += 1;
        KnxIpFrame::SecureWrapper(wrapper)
    }

    /// Unwrap a received frame.
    ///
    /// # Errors
    ///
    /// - `AuthenticationFailed` for a foreign session id or a bad MAC
    /// - `ReplayOrOutOfOrder` if the sequence number does not increase
    ///
    /// On error the receive state is untouched.
    pub fn unwrap(&mut self, frame: &KnxIpFrame) -> Result<Vec<u8>> {
        let KnxIpFrame::SecureWrapper(wrapper) = frame else {
            return Err(KnxError::authentication_failed());
        };
        if wrapper.secure_session_id != self.session_id {
            return Err(KnxError::authentication_failed());
        }
        let inner = open(&self.key, wrapper)?;
        let sequence = sequence_value(&wrapper.sequence_information);
        if self.last_received.is_some_and(|last| sequence <= last) {
            return Err(KnxError::replay_or_out_of_order());
        }
        self.last_received = Some(sequence);
        Ok(inner)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher")
            .field("session_id", &self.session_id)
            .field("send_sequence", &self.send_sequence)
            .field("last_received", &self.last_received)
            .finish_non_exhaustive()
    }
}

/// MAC the server puts in its session response, before CTR encryption.
fn session_response_mac(device_key: &Key, session_id: u16, public_xor: &[u8; 32]) -> [u8; 16] {
    let mut additional = Vec::with_capacity(40);
    additional.extend_from_slice(&[0x06, 0x10, 0x09, 0x52, 0x00, 0x38]);
    additional.extend_from_slice(&session_id.to_be_bytes());
    additional.extend_from_slice(public_xor);
    cbc_mac(device_key, &additional, &[], &[0; 16])
}

/// Encrypted MAC of the session authenticate frame.
pub fn authenticate_mac(user_key: &Key, user_id: u8, public_xor: &[u8; 32]) -> [u8; 16] {
    let mut additional = Vec::with_capacity(40);
    additional.extend_from_slice(&[0x06, 0x10, 0x09, 0x53, 0x00, 0x18, 0x00, user_id]);
    additional.extend_from_slice(public_xor);
    let mac = cbc_mac(user_key, &additional, &[], &[0; 16]);
    ctr(user_key, &COUNTER_0_HANDSHAKE, &mac, &[]).1
}

/// Encrypted MAC a server puts in its session response.
pub fn session_response_encrypted_mac(
    device_key: &Key,
    session_id: u16,
    public_xor: &[u8; 32],
) -> [u8; 16] {
    let mac = session_response_mac(device_key, session_id, public_xor);
    ctr(device_key, &COUNTER_0_HANDSHAKE, &mac, &[]).1
}

/// Authenticated KNX IP Secure session over an inner transport.
pub struct SecureSession<T> {
    inner: T,
    gateway: SocketAddr,
    cipher: SessionCipher,
    last_send: Instant,
    buffer: Vec<u8>,
    closed: bool,
}

impl<T: AsyncTransport> SecureSession<T> {
    /// Run the handshake on `inner` with a fresh key pair.
    ///
    /// # Errors
    ///
    /// - `AuthenticationFailed` if the server's response MAC is wrong or it
    ///   rejects our user credentials
    /// - `Timeout` if the server does not answer
    pub async fn establish(
        inner: T,
        gateway: SocketAddr,
        credentials: &SessionCredentials,
    ) -> Result<Self> {
        let (secret, _) = generate_key_pair();
        Self::establish_with_secret(inner, gateway, credentials, secret).await
    }

    /// Handshake with a caller supplied private key.
    #[doc(hidden)]
    pub async fn establish_with_secret(
        mut inner: T,
        gateway: SocketAddr,
        credentials: &SessionCredentials,
        secret: StaticSecret,
    ) -> Result<Self> {
        let client_public = PublicKey::from(&secret).to_bytes();
        let request = KnxIpFrame::SessionRequest(SessionRequest {
            control_endpoint: Hpai::tcp(),
            ecdh_client_public_key: client_public,
        });
        inner.send_to(&request.to_bytes(), gateway).await?;
        knx_log!(debug, "Secure session requested from {}", gateway);

        let mut buffer = vec![0u8; MAX_FRAME_SIZE];
        let response = timeout(CONNECT_REQUEST_TIMEOUT, async {
            loop {
                let (n, _) = inner.recv_from(&mut buffer).await?;
                match KnxIpFrame::from_bytes(&buffer[..n]) {
                    Ok((KnxIpFrame::SessionResponse(response), _)) => {
                        break Ok::<_, KnxError>(response);
                    }
                    Ok((other, _)) => {
                        knx_log!(debug, "Ignoring {:?} during session setup", other.service_type());
                    }
                    Err(e) => knx_log!(debug, "Ignoring undecodable frame: {}", e),
                }
            }
        })
        .await??;

        let public_xor = xor(&client_public, &response.ecdh_server_public_key);
        if let Some(device_key) = &credentials.device_authentication_key {
            let expected = session_response_mac(device_key, response.secure_session_id, &public_xor);
            let received = ctr(
                device_key,
                &COUNTER_0_HANDSHAKE,
                &response.message_authentication_code,
                &[],
            )
            .1;
            if !macs_equal(&expected, &received) {
                knx_log!(warn, "Session response from {} failed verification", gateway);
                return Err(KnxError::authentication_failed());
            }
        }

        let key = session_key(&secret, &response.ecdh_server_public_key);
        let mut session = Self {
            inner,
            gateway,
            cipher: SessionCipher::new(
                key,
                response.secure_session_id,
                credentials.serial_number,
                credentials.message_tag,
            ),
            last_send: Instant::now(),
            buffer,
            closed: false,
        };

        let authenticate = KnxIpFrame::SessionAuthenticate(SessionAuthenticate {
            user_id: credentials.user_id,
            message_authentication_code: authenticate_mac(
                &credentials.user_password_key,
                credentials.user_id,
                &public_xor,
            ),
        });
        session.send_wrapped(&authenticate.to_bytes()).await?;

        let status = timeout(CONNECT_REQUEST_TIMEOUT, async {
            loop {
                let frame = session.recv_unwrapped().await?;
                if let KnxIpFrame::SessionStatus(status) = frame {
                    break Ok::<_, KnxError>(status.status);
                }
            }
        })
        .await??;
        if status != SecureSessionStatus::AuthenticationSuccess {
            knx_log!(warn, "Secure session authentication rejected: {:?}", status);
            return Err(KnxError::authentication_failed());
        }
        knx_log!(
            info,
            "Secure session {} established with {}",
            session.cipher.session_id(),
            gateway
        );
        Ok(session)
    }

    /// Session identifier assigned by the server
    pub fn session_id(&self) -> u16 {
        self.cipher.session_id()
    }

    async fn send_wrapped(&mut self, frame: &[u8]) -> Result<()> {
        let wrapped = self.cipher.wrap(frame).to_bytes();
        self.inner.send_to(&wrapped, self.gateway).await?;
        self.last_send = Instant::now();
        Ok(())
    }

    async fn send_status(&mut self, status: SecureSessionStatus) -> Result<()> {
        let frame = KnxIpFrame::SessionStatus(SessionStatus { status });
        self.send_wrapped(&frame.to_bytes()).await
    }

    /// Next authenticated frame from the gateway, decoded.
    ///
    /// Plain frames are dropped; a secure session carries nothing else.
    async fn recv_unwrapped(&mut self) -> Result<KnxIpFrame> {
        loop {
            let (n, _) = self.inner.recv_from(&mut self.buffer).await?;
            let frame = match KnxIpFrame::from_bytes(&self.buffer[..n]) {
                Ok((frame @ KnxIpFrame::SecureWrapper(_), _)) => frame,
                Ok((other, _)) => {
                    knx_log!(warn, "Dropping unsecured {:?} on secure session", other.service_type());
                    continue;
                }
                Err(e) => {
                    knx_log!(debug, "Ignoring undecodable frame: {}", e);
                    continue;
                }
            };
            let inner = self.cipher.unwrap(&frame).inspect_err(|e| {
                knx_log!(warn, "Secure wrapper rejected: {}", e);
            })?;
            match KnxIpFrame::from_bytes(&inner) {
                Ok((frame, _)) => return Ok(frame),
                Err(e) => {
                    knx_log!(debug, "Ignoring undecodable wrapped frame: {}", e);
                }
            }
        }
    }
}

impl<T> fmt::Debug for SecureSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("gateway", &self.gateway)
            .field("cipher", &self.cipher)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: AsyncTransport> AsyncTransport for SecureSession<T> {
    async fn send_to(&mut self, data: &[u8], _addr: SocketAddr) -> Result<()> {
        if self.closed {
            return Err(KnxError::connection_closed());
        }
        self.send_wrapped(data).await
    }

    /// Returns the next decrypted frame.
    ///
    /// # Errors
    ///
    /// Security failures are returned per frame and leave the session
    /// usable; the caller decides whether to keep reading. A peer status of
    /// close, timeout or unauthenticated ends the session with
    /// `ConnectionClosed`.
    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        loop {
            if self.closed {
                return Err(KnxError::connection_closed());
            }
            let frame = self.recv_unwrapped().await?;
            if let KnxIpFrame::SessionStatus(SessionStatus { status }) = frame {
                match status {
                    SecureSessionStatus::Close
                    | SecureSessionStatus::Timeout
                    | SecureSessionStatus::Unauthenticated => {
                        knx_log!(info, "Secure session closed by peer: {:?}", status);
                        self.closed = true;
                        self.inner.close().await?;
                        return Err(KnxError::connection_closed());
                    }
                    other => {
                        knx_log!(debug, "Session status {:?} ignored", other);
                        continue;
                    }
                }
            }
            let bytes = frame.to_bytes();
            let target = buf
                .get_mut(..bytes.len())
                .ok_or_else(KnxError::buffer_too_small)?;
            target.copy_from_slice(&bytes);
            return Ok((bytes.len(), self.gateway));
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn protocol(&self) -> TransportProtocol {
        self.inner.protocol()
    }

    fn is_ready(&self) -> bool {
        !self.closed && self.inner.is_ready()
    }

    fn maintenance_deadline(&self) -> Option<Instant> {
        (!self.closed).then(|| self.last_send + SESSION_KEEPALIVE_INTERVAL)
    }

    async fn maintain(&mut self) -> Result<()> {
        if !self.closed && Instant::now() >= self.last_send + SESSION_KEEPALIVE_INTERVAL {
            knx_log!(trace, "Secure session keepalive");
            self.send_status(SecureSessionStatus::KeepAlive).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            // The peer may already be gone.
            if let Err(e) = self.send_status(SecureSessionStatus::Close).await {
                knx_log!(debug, "Session close not sent: {}", e);
            }
            self.inner.close().await?;
        }
        Ok(())
    }
}

/// Opens a transport from `inner` and runs the session handshake on it.
#[derive(Debug)]
pub struct SecureSessionFactory<F> {
    /// Factory for the unsecured stream
    pub inner: F,
    /// Server control endpoint
    pub gateway: SocketAddr,
    /// Session credentials
    pub credentials: SessionCredentials,
}

#[async_trait]
impl<F: TransportFactory> TransportFactory for SecureSessionFactory<F> {
    type Transport = SecureSession<F::Transport>;

    async fn open(&self) -> Result<Self::Transport> {
        let inner = self.inner.open().await?;
        SecureSession::establish(inner, self.gateway, &self.credentials).await
    }
}
