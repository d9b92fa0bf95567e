use crate::*;
use ed25519_dalek::ExpandedSecretKey;
use ed25519_dalek::Keypair;
use ed25519_dalek::PublicKey;
use ed25519_dalek::SecretKey;
use ed25519_dalek::Signature;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::convert::TryFrom;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

/// Holds the results-signing key pair.
///
/// Loaded once at startup and handed to `ResultsSigner`. There is no global key.
pub struct SigningKeyProvider {
    secret: SecretKey,
    public: PublicKey,
}

impl SigningKeyProvider {
    /// Load the secret key from `path`, generating and persisting one if the file does
    /// not exist.
    ///
    /// An existing file that cannot be parsed is an error. It is never replaced, since
    /// that would orphan every signature already published.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let contents = Zeroizing::new(fs::read_to_string(path)?);
            let provider = SigningKeyProvider::from_hex(&contents).map_err(|_| {
                Error::MalformedKey(format!("signing key at {} is unreadable", path.display()))
            })?;
            debug!("loaded signing key {} from {}", provider.fingerprint(), path.display());
            return Ok(provider);
        }

        let provider = SigningKeyProvider::generate();
        write_secret_file(path, provider.secret_hex().as_bytes())?;
        info!("created signing key {} at {}", provider.fingerprint(), path.display());

        Ok(provider)
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_bytes(bytes)
            .map_err(|e| Error::MalformedKey(format!("signing key: {}", e)))?;
        let public: PublicKey = (&secret).into();
        Ok(SigningKeyProvider { secret, public })
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(hex_str.trim())
                .map_err(|_| Error::MalformedKey("signing key is not valid hex".to_owned()))?,
        );
        SigningKeyProvider::from_secret_bytes(&bytes)
    }

    /// A fresh, unpersisted key pair
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng {};
        let Keypair { public, secret } = Keypair::generate(&mut csprng);
        SigningKeyProvider { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// The secret key in the on-disk format
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.secret.as_bytes()))
    }

    /// First 16 hex characters of SHA-256(public key)
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.public.as_bytes());
        hex::encode(&digest[..8])
    }
}

impl std::fmt::Debug for SigningKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SigningKeyProvider({})", self.fingerprint())
    }
}

/// Ed25519 signing of canonical results
#[derive(Debug)]
pub struct ResultsSigner {
    keys: SigningKeyProvider,
}

impl ResultsSigner {
    pub fn new(keys: SigningKeyProvider) -> Self {
        ResultsSigner { keys }
    }

    /// Sign bytes that are already in canonical form
    pub fn sign(&self, canonical_bytes: &[u8]) -> Signature {
        let expanded: ExpandedSecretKey = (&self.keys.secret).into();
        expanded.sign(canonical_bytes, &self.keys.public)
    }

    pub fn verify(&self, canonical_bytes: &[u8], signature: &Signature) -> bool {
        verify_detached(canonical_bytes, signature, &self.keys.public)
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keys.public.as_bytes())
    }

    pub fn fingerprint(&self) -> String {
        self.keys.fingerprint()
    }

    /// Canonicalize `bundle` (sorted keys, no whitespace) and sign it
    pub fn sign_bundle<T: Serialize>(&self, bundle: &T) -> Result<SignedBundle> {
        let bytes = canonical_json(bundle)?;
        let signature = self.sign(&bytes);

        Ok(SignedBundle {
            bundle: serde_json::from_slice(&bytes)?,
            signature,
            public_key: self.keys.public,
        })
    }

    /// Verify a bundle against this signer's key, ignoring the embedded one
    pub fn verify_bundle(&self, signed: &SignedBundle) -> Result<bool> {
        signed.verify_with(&self.keys.public)
    }
}

/// A results bundle with a detached signature over its canonical form
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignedBundle {
    pub bundle: Value,

    #[serde(with = "EdSignatureHex")]
    pub signature: Signature,

    #[serde(with = "EdPublicKeyHex")]
    pub public_key: PublicKey,
}

impl SignedBundle {
    /// Verify against the embedded public key
    pub fn verify(&self) -> Result<bool> {
        self.verify_with(&self.public_key)
    }

    /// Verify against a trusted public key
    pub fn verify_with(&self, public_key: &PublicKey) -> Result<bool> {
        let bytes = canonical_json(&self.bundle)?;
        Ok(verify_detached(&bytes, &self.signature, public_key))
    }
}

/// Verify a detached signature
pub fn verify_detached(canonical_bytes: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    public_key.verify_strict(canonical_bytes, signature).is_ok()
}

/// Verify a detached signature given hex-encoded signature and public key.
///
/// Malformed encodings are an error rather than `false`.
pub fn verify_detached_hex(
    canonical_bytes: &[u8],
    signature_hex: &str,
    public_key_hex: &str,
) -> Result<bool> {
    let sig_bytes = hex::decode(signature_hex.trim())
        .map_err(|_| Error::MalformedKey("signature is not valid hex".to_owned()))?;
    let pk_bytes = hex::decode(public_key_hex.trim())
        .map_err(|_| Error::MalformedKey("public key is not valid hex".to_owned()))?;

    let signature = Signature::try_from(&sig_bytes[..])?;
    let public_key = PublicKey::from_bytes(&pk_bytes)?;

    Ok(verify_detached(canonical_bytes, &signature, &public_key))
}
