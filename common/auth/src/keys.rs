use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::class::{ClassIdentifiers, TokenClass};
use crate::error::{AuthError, AuthResult};

/// Modulus size for every generated signing key.
pub const RSA_KEY_BITS: usize = 2048;

/// PEM-encoded (PKCS#1) RSA key pair for one token class.
#[derive(Clone)]
pub struct KeyPair {
    class: TokenClass,
    public_pem: String,
    private_pem: Zeroizing<String>,
}

impl KeyPair {
    pub fn class(&self) -> TokenClass {
        self.class
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn private_pem(&self) -> &str {
        &self.private_pem
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class
            && self.public_pem == other.public_pem
            && *self.private_pem == *other.private_pem
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("class", &self.class)
            .field("public_pem", &self.public_pem)
            .field("private_pem", &"<redacted>")
            .finish()
    }
}

/// A key pair together with its parsed signing and verification keys.
struct LoadedKeys {
    pair: KeyPair,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl LoadedKeys {
    fn from_pair(pair: KeyPair) -> AuthResult<Self> {
        let class = pair.class;
        let load_err = |reason: String| AuthError::KeyLoad { class, reason };

        let private = RsaPrivateKey::from_pkcs1_pem(pair.private_pem())
            .map_err(|err| load_err(format!("private key is not PKCS#1 PEM: {err}")))?;
        let public = RsaPublicKey::from_pkcs1_pem(pair.public_pem())
            .map_err(|err| load_err(format!("public key is not PKCS#1 PEM: {err}")))?;
        if private.to_public_key() != public {
            return Err(load_err("public key does not match private key".into()));
        }

        let encoding = EncodingKey::from_rsa_pem(pair.private_pem().as_bytes())
            .map_err(|err| load_err(format!("unusable private key: {err}")))?;
        let decoding = DecodingKey::from_rsa_pem(pair.public_pem().as_bytes())
            .map_err(|err| load_err(format!("unusable public key: {err}")))?;

        Ok(Self {
            pair,
            encoding,
            decoding,
        })
    }
}

struct KeySlot {
    identifier: String,
    // Serialises load/generate/rotate for one class; readers go through `loaded`.
    generation: Mutex<()>,
    loaded: RwLock<Option<Arc<LoadedKeys>>>,
}

impl KeySlot {
    fn new(identifier: String) -> Self {
        Self {
            identifier,
            generation: Mutex::new(()),
            loaded: RwLock::new(None),
        }
    }

    fn cached(&self) -> Option<Arc<LoadedKeys>> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, keys: Arc<LoadedKeys>) {
        *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = Some(keys);
    }
}

/// File-backed owner of the per-class RSA key pairs.
///
/// Keys live in `<dir>/public.<id>.pem` and `<dir>/private.<id>.pem`. A pair
/// is generated at most once per class; afterwards it is only ever read,
/// unless [`KeyStore::rotate`] is called explicitly.
pub struct KeyStore {
    dir: PathBuf,
    slots: [KeySlot; 2],
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>, identifiers: ClassIdentifiers) -> Self {
        Self {
            dir: dir.into(),
            slots: [
                KeySlot::new(identifiers.access),
                KeySlot::new(identifiers.refresh),
            ],
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn identifier(&self, class: TokenClass) -> &str {
        &self.slot(class).identifier
    }

    pub fn public_path(&self, class: TokenClass) -> PathBuf {
        self.dir.join(format!("public.{}.pem", self.identifier(class)))
    }

    pub fn private_path(&self, class: TokenClass) -> PathBuf {
        self.dir.join(format!("private.{}.pem", self.identifier(class)))
    }

    /// Returns the persisted pair for `class`, generating and persisting one
    /// first if none exists yet. Repeated calls never regenerate.
    pub fn ensure_key_pair(&self, class: TokenClass) -> AuthResult<KeyPair> {
        let slot = self.slot(class);
        if let Some(keys) = slot.cached() {
            return Ok(keys.pair.clone());
        }

        let _guard = slot
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(keys) = slot.cached() {
            return Ok(keys.pair.clone());
        }

        let pair = match self.read_persisted(class)? {
            Some(pair) => {
                info!(token_class = %class, dir = %self.dir.display(), "Loaded existing key pair");
                pair
            }
            None => {
                let pair = generate_pair(class)?;
                self.persist(&pair)?;
                info!(token_class = %class, dir = %self.dir.display(), "Generated new key pair");
                pair
            }
        };

        let keys = Arc::new(LoadedKeys::from_pair(pair)?);
        slot.store(keys.clone());
        Ok(keys.pair.clone())
    }

    /// Ensures both token classes have a key pair. Meant to run to completion
    /// before any listener accepts traffic.
    pub fn ensure_all(&self) -> AuthResult<()> {
        for class in TokenClass::ALL {
            self.ensure_key_pair(class)?;
        }
        Ok(())
    }

    /// Replaces the key pair of `class` only. Tokens signed with the previous
    /// key stop verifying immediately.
    pub fn rotate(&self, class: TokenClass) -> AuthResult<KeyPair> {
        let slot = self.slot(class);
        let _guard = slot
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let pair = generate_pair(class)?;
        self.persist(&pair)?;
        let keys = Arc::new(LoadedKeys::from_pair(pair)?);
        slot.store(keys.clone());
        info!(token_class = %class, "Rotated key pair");
        Ok(keys.pair.clone())
    }

    pub fn key_pair(&self, class: TokenClass) -> AuthResult<KeyPair> {
        Ok(self.loaded(class)?.pair.clone())
    }

    pub fn private_key(&self, class: TokenClass) -> AuthResult<EncodingKey> {
        Ok(self.loaded(class)?.encoding.clone())
    }

    pub fn public_key(&self, class: TokenClass) -> AuthResult<DecodingKey> {
        Ok(self.loaded(class)?.decoding.clone())
    }

    fn slot(&self, class: TokenClass) -> &KeySlot {
        &self.slots[class.index()]
    }

    fn loaded(&self, class: TokenClass) -> AuthResult<Arc<LoadedKeys>> {
        let slot = self.slot(class);
        if let Some(keys) = slot.cached() {
            return Ok(keys);
        }

        let _guard = slot
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(keys) = slot.cached() {
            return Ok(keys);
        }

        let pair = self
            .read_persisted(class)?
            .ok_or_else(|| AuthError::KeyLoad {
                class,
                reason: format!("no key pair persisted in {}", self.dir.display()),
            })?;
        let keys = Arc::new(LoadedKeys::from_pair(pair)?);
        slot.store(keys.clone());
        debug!(token_class = %class, "Loaded key pair on demand");
        Ok(keys)
    }

    fn read_persisted(&self, class: TokenClass) -> AuthResult<Option<KeyPair>> {
        let public_path = self.public_path(class);
        let private_path = self.private_path(class);
        let load_err = |reason: String| AuthError::KeyLoad { class, reason };

        match (public_path.exists(), private_path.exists()) {
            (false, false) => Ok(None),
            (true, true) => {
                let public_pem = fs::read_to_string(&public_path).map_err(|err| {
                    load_err(format!("cannot read {}: {err}", public_path.display()))
                })?;
                let private_pem = fs::read_to_string(&private_path).map_err(|err| {
                    load_err(format!("cannot read {}: {err}", private_path.display()))
                })?;
                Ok(Some(KeyPair {
                    class,
                    public_pem,
                    private_pem: Zeroizing::new(private_pem),
                }))
            }
            (true, false) => Err(load_err(format!(
                "incomplete key pair: {} is missing",
                private_path.display()
            ))),
            (false, true) => self.recover_public_half(class).map(Some),
        }
    }

    /// A private key without its public half is what an interrupted first
    /// write leaves behind; the public key is derived from it again.
    fn recover_public_half(&self, class: TokenClass) -> AuthResult<KeyPair> {
        let private_path = self.private_path(class);
        let load_err = |reason: String| AuthError::KeyLoad { class, reason };

        let private_pem = Zeroizing::new(fs::read_to_string(&private_path).map_err(|err| {
            load_err(format!("cannot read {}: {err}", private_path.display()))
        })?);
        let public_pem = RsaPrivateKey::from_pkcs1_pem(&private_pem)
            .map_err(|err| load_err(format!("private key is not PKCS#1 PEM: {err}")))?
            .to_public_key()
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|err| load_err(format!("cannot encode public key: {err}")))?;

        write_atomic(&self.public_path(class), public_pem.as_bytes(), 0o644)
            .map_err(|err| load_err(format!("cannot persist public key: {err}")))?;
        warn!(token_class = %class, "Restored missing public key from private key");

        Ok(KeyPair {
            class,
            public_pem,
            private_pem,
        })
    }

    // Private half first: an orphaned private key can be recovered, an
    // orphaned public key cannot.
    fn persist(&self, pair: &KeyPair) -> AuthResult<()> {
        let class = pair.class;
        fs::create_dir_all(&self.dir).map_err(|err| AuthError::KeyLoad {
            class,
            reason: format!("cannot create {}: {err}", self.dir.display()),
        })?;

        write_atomic(&self.private_path(class), pair.private_pem().as_bytes(), 0o600)
            .map_err(|err| AuthError::KeyLoad {
                class,
                reason: format!("cannot persist private key: {err}"),
            })?;
        write_atomic(&self.public_path(class), pair.public_pem().as_bytes(), 0o644).map_err(
            |err| AuthError::KeyLoad {
                class,
                reason: format!("cannot persist public key: {err}"),
            },
        )?;
        Ok(())
    }
}

fn generate_pair(class: TokenClass) -> AuthResult<KeyPair> {
    let gen_err = |reason: String| AuthError::KeyGeneration { class, reason };

    let mut rng = OsRng;
    let private_key =
        RsaPrivateKey::new(&mut rng, RSA_KEY_BITS).map_err(|err| gen_err(err.to_string()))?;
    let private_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|err| gen_err(err.to_string()))?;
    let public_pem = private_key
        .to_public_key()
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|err| gen_err(err.to_string()))?;

    Ok(KeyPair {
        class,
        public_pem,
        private_pem,
    })
}

/// Writes `contents` next to `path` and renames it into place, so readers
/// never observe a half-written key file.
fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let tmp = path.with_extension("pem.tmp");
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}
