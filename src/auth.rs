use crate::protocol::{AdbError, AuthType, Command, Packet};
use base64::{engine::general_purpose, Engine as _};
use md5::{Digest, Md5};
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
    pkcs8::DecodePrivateKey,
    traits::PublicKeyParts,
    BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use sha1::Sha1;
use std::sync::Mutex;

/// Modulus size of the keys adbd accepts (RSA-2048).
pub const ANDROID_PUBKEY_MODULUS_SIZE: usize = 2048 / 8;

/// Size of the binary public-key struct before base64:
/// word count, n0inv, modulus, rr, exponent.
pub const ANDROID_PUBKEY_ENCODED_SIZE: usize = 4 + 4 + ANDROID_PUBKEY_MODULUS_SIZE * 2 + 4;

const RSA_BITS: usize = 2048;

/// Length of the challenge in `AUTH TOKEN`; adbd signs it as a SHA-1 digest.
pub const TOKEN_SIZE: usize = 20;

/// ADB key pair for authentication
#[derive(Clone)]
pub struct AdbKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    name: Option<String>,
}

impl std::fmt::Debug for AdbKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbKeyPair")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint().ok())
            .finish_non_exhaustive()
    }
}

impl AdbKeyPair {
    /// Generate a new 2048-bit RSA key pair (public exponent 65537)
    pub fn generate() -> Result<Self, AdbError> {
        use rsa::rand_core::OsRng;

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| AdbError::AuthenticationFailed(format!("Failed to generate key: {}", e)))?;

        Ok(Self::from_private_key(private_key))
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
            name: None,
        }
    }

    /// Load from PEM-encoded private key string
    pub fn from_pem(pem: &str) -> Result<Self, AdbError> {
        // Try PKCS#1 first
        let private_key = if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            key
        } else {
            // Try PKCS#8
            RsaPrivateKey::from_pkcs8_pem(pem)
                .map_err(|e| AdbError::AuthenticationFailed(format!("Failed to parse PEM: {}", e)))?
        };

        Ok(Self::from_private_key(private_key))
    }

    /// Attach the human-readable name sent along with the public key.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Sign a token (challenge from device).
    ///
    /// adbd treats the 20-byte token as an already computed SHA-1 digest, so
    /// it is wrapped in the SHA-1 DigestInfo and padded without hashing again.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>, AdbError> {
        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), token)
            .map_err(|e| AdbError::AuthenticationFailed(format!("Failed to sign token: {}", e)))
    }

    /// Public key in the binary layout adbd stores in `adb_keys`.
    pub fn android_public_key(&self) -> Result<Vec<u8>, AdbError> {
        let n = self.public_key.n();
        let modulus = to_le_fixed(n, ANDROID_PUBKEY_MODULUS_SIZE)?;

        let n0 = u32::from_le_bytes([modulus[0], modulus[1], modulus[2], modulus[3]]);
        let n0inv = inverse_mod_2_32(n0).wrapping_neg();

        // rr = 2^(2 * 2048) mod n, the Montgomery constant
        let rr = (BigUint::from(1u32) << (RSA_BITS * 2)) % n;
        let rr = to_le_fixed(&rr, ANDROID_PUBKEY_MODULUS_SIZE)?;

        let exponent = self.public_key.e().to_bytes_le();
        if exponent.len() > 4 {
            return Err(AdbError::AuthenticationFailed(
                "public exponent does not fit in 32 bits".to_string(),
            ));
        }
        let mut e = [0u8; 4];
        e[..exponent.len()].copy_from_slice(&exponent);

        let mut out = Vec::with_capacity(ANDROID_PUBKEY_ENCODED_SIZE);
        out.extend_from_slice(&((ANDROID_PUBKEY_MODULUS_SIZE / 4) as u32).to_le_bytes());
        out.extend_from_slice(&n0inv.to_le_bytes());
        out.extend_from_slice(&modulus);
        out.extend_from_slice(&rr);
        out.extend_from_slice(&e);
        Ok(out)
    }

    /// `AUTH` public-key payload: base64 of the key struct, then ` name` if
    /// `name` is non-empty, then NUL.
    pub fn public_key_payload(&self, name: &str) -> Result<Vec<u8>, AdbError> {
        let encoded = general_purpose::STANDARD.encode(self.android_public_key()?);

        let mut result = encoded.into_bytes();
        if !name.is_empty() {
            result.push(b' ');
            result.extend_from_slice(name.as_bytes());
        }
        result.push(0);

        Ok(result)
    }

    /// Colon-separated MD5 of the public-key struct, as shown by the device dialog.
    pub fn fingerprint(&self) -> Result<String, AdbError> {
        let digest = Md5::digest(self.android_public_key()?);
        Ok(digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":"))
    }

    /// PKCS#1 PEM, for callers that persist keys.
    pub fn private_key_pem(&self) -> Result<String, AdbError> {
        let pem = self
            .private_key
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AdbError::AuthenticationFailed(format!("Failed to encode private key: {}", e)))?;
        Ok(pem.to_string())
    }
}

fn to_le_fixed(value: &BigUint, size: usize) -> Result<Vec<u8>, AdbError> {
    let mut bytes = value.to_bytes_le();
    if bytes.len() > size {
        return Err(AdbError::AuthenticationFailed(format!(
            "key is larger than {} bits",
            size * 8
        )));
    }
    bytes.resize(size, 0);
    Ok(bytes)
}

/// Inverse of an odd `value` modulo 2^32 by Newton iteration.
fn inverse_mod_2_32(value: u32) -> u32 {
    let mut inv = value;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(value.wrapping_mul(inv)));
    }
    inv
}

/// Keys handed out one at a time; load failures appear inline.
pub type KeyIter<'a> = Box<dyn Iterator<Item = Result<AdbKeyPair, AdbError>> + Send + 'a>;

/// Source of private keys for the handshake. Persistence is up to the implementor.
pub trait CredentialProvider: Send + Sync {
    /// Mint a fresh RSA-2048 key (exponent 65537).
    fn generate_key(&self) -> Result<AdbKeyPair, AdbError>;

    /// A fresh iterator over stored keys. Entries that fail to load are
    /// yielded as errors instead of aborting the iteration.
    fn iterate_keys(&self) -> KeyIter<'_>;
}

enum StoredKey {
    Pem(String),
    Loaded(AdbKeyPair),
}

/// In-memory credential store; keys are kept for the lifetime of the value.
#[derive(Default)]
pub struct MemoryCredentialStore {
    keys: Mutex<Vec<StoredKey>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store PEM strings; they are parsed lazily on iteration.
    pub fn from_pems<I, S>(pems: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = pems.into_iter().map(|pem| StoredKey::Pem(pem.into())).collect();
        Self {
            keys: Mutex::new(keys),
        }
    }

    pub fn add_key(&self, key: AdbKeyPair) {
        self.lock().push(StoredKey::Loaded(key));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredKey>> {
        // A poisoned store still holds valid keys.
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CredentialProvider for MemoryCredentialStore {
    fn generate_key(&self) -> Result<AdbKeyPair, AdbError> {
        let key = AdbKeyPair::generate()?;
        self.add_key(key.clone());
        Ok(key)
    }

    fn iterate_keys(&self) -> KeyIter<'_> {
        let snapshot: Vec<Result<AdbKeyPair, String>> = self
            .lock()
            .iter()
            .map(|stored| match stored {
                StoredKey::Pem(pem) => Err(pem.clone()),
                StoredKey::Loaded(key) => Ok(key.clone()),
            })
            .collect();

        Box::new(snapshot.into_iter().map(|entry| match entry {
            Ok(key) => Ok(key),
            Err(pem) => AdbKeyPair::from_pem(&pem),
        }))
    }
}

/// Notifications fired while the processor walks through keys.
///
/// Every method has an empty default; `()` is the silent observer.
pub trait AuthObserver: Send + Sync {
    fn on_key_load_error(&self, _error: &AdbError) {}

    /// A signature made with the key of this fingerprint was sent.
    fn on_signature_attempted(&self, _fingerprint: &str) {}

    /// The device asked again after a signature, so that key was not accepted.
    fn on_signature_rejected(&self, _fingerprint: &str) {}

    /// Every stored key failed; the public key was sent for user approval.
    fn on_public_key_sent(&self, _fingerprint: &str) {}
}

impl AuthObserver for () {}

/// Answers `AUTH TOKEN` challenges: first with signatures from each stored
/// key in turn, then once with a public key for the user to accept.
pub struct AuthProcessor<'a> {
    provider: &'a dyn CredentialProvider,
    observer: &'a dyn AuthObserver,
    key_name: String,
    keys: Option<KeyIter<'a>>,
    first_key: Option<AdbKeyPair>,
    last_attempted: Option<String>,
    public_key_sent: bool,
}

impl<'a> AuthProcessor<'a> {
    pub fn new(
        provider: &'a dyn CredentialProvider,
        observer: &'a dyn AuthObserver,
        key_name: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            observer,
            key_name: key_name.into(),
            keys: None,
            first_key: None,
            last_attempted: None,
            public_key_sent: false,
        }
    }

    /// Produce the reply to one `AUTH` packet from the device.
    pub fn process(&mut self, packet: &Packet) -> Result<Packet, AdbError> {
        if packet.command != Command::Auth || AuthType::from_u32(packet.arg0) != Some(AuthType::Token) {
            return Err(AdbError::AuthenticationFailed(format!(
                "expected AUTH TOKEN, got {} type {}",
                packet.command, packet.arg0
            )));
        }

        if packet.payload.len() != TOKEN_SIZE {
            return Err(AdbError::AuthenticationFailed(format!(
                "AUTH TOKEN must be {} bytes, got {}",
                TOKEN_SIZE,
                packet.payload.len()
            )));
        }

        if self.public_key_sent {
            return Err(AdbError::AuthenticationFailed(
                "device rejected every signature and the public key".to_string(),
            ));
        }

        if let Some(previous) = self.last_attempted.take() {
            log::debug!("Key {} rejected by device", previous);
            self.observer.on_signature_rejected(&previous);
        }

        if let Some(reply) = self.next_signature(&packet.payload)? {
            return Ok(reply);
        }

        self.public_key_reply()
    }

    fn next_signature(&mut self, token: &[u8]) -> Result<Option<Packet>, AdbError> {
        let provider = self.provider;
        let keys = self.keys.get_or_insert_with(|| provider.iterate_keys());

        for entry in keys.by_ref() {
            let key = match entry {
                Ok(key) => key,
                Err(e) => {
                    log::warn!("Failed to load key: {}", e);
                    self.observer.on_key_load_error(&e);
                    continue;
                }
            };

            let attempt = key.sign_token(token).and_then(|sig| Ok((sig, key.fingerprint()?)));
            let (signature, fingerprint) = match attempt {
                Ok(attempt) => attempt,
                Err(e) => {
                    log::warn!("Failed to sign with key: {}", e);
                    self.observer.on_key_load_error(&e);
                    continue;
                }
            };

            if self.first_key.is_none() {
                self.first_key = Some(key);
            }

            log::debug!("Trying key {}", fingerprint);
            self.observer.on_signature_attempted(&fingerprint);
            self.last_attempted = Some(fingerprint);

            return Ok(Some(Packet::new(
                Command::Auth,
                AuthType::Signature as u32,
                0,
                signature,
            )));
        }

        Ok(None)
    }

    fn public_key_reply(&mut self) -> Result<Packet, AdbError> {
        self.keys = None;

        let key = match self.first_key.take() {
            Some(key) => key,
            None => {
                log::info!("No usable key stored, generating one");
                self.provider.generate_key()?
            }
        };

        let name = key.name().unwrap_or(&self.key_name).to_string();
        let payload = key.public_key_payload(&name)?;
        let fingerprint = key.fingerprint()?;

        log::info!("Sending public key {} for approval on device", fingerprint);
        self.observer.on_public_key_sent(&fingerprint);
        self.public_key_sent = true;

        Ok(Packet::new(
            Command::Auth,
            AuthType::RsaPublicKey as u32,
            0,
            payload,
        ))
    }
}
