use crate::*;
use aes_gcm::aead::{generic_array::GenericArray, Aead, NewAead};
use aes_gcm::Aes256Gcm;
use rand::rngs::OsRng;
use rand::RngCore;

/// An AEAD-sealed ballot
///
/// `ciphertext` carries the 16-byte authentication tag at its end; the nonce is kept
/// separately so it can be stored in its own column.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedBallot {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// AES-256-GCM over canonical ballot bytes
///
/// Every call to `encrypt` draws a fresh 96-bit nonce from the OS RNG.
pub struct BallotCipher {
    key: DataKey,
}

impl BallotCipher {
    pub fn new(key: DataKey) -> Self {
        BallotCipher { key }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<SealedBallot> {
        let aead = Aes256Gcm::new(GenericArray::from_slice(self.key.as_bytes()));

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = aead
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Encryption)?;

        Ok(SealedBallot { ciphertext, nonce })
    }

    /// Decrypt and verify. The input is never modified, even on failure.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LEN || ciphertext.len() < TAG_LEN {
            return Err(Error::Authentication);
        }

        let aead = Aes256Gcm::new(GenericArray::from_slice(self.key.as_bytes()));
        aead.decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Authentication)
    }

    pub fn open(&self, sealed: &SealedBallot) -> Result<Vec<u8>> {
        self.decrypt(&sealed.ciphertext, &sealed.nonce)
    }
}

impl std::fmt::Debug for BallotCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "BallotCipher(AES-256-GCM)")
    }
}
