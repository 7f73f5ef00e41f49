use rand::rngs::OsRng;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use log::debug;
use thiserror::Error;

use std::fmt;
use std::fs;
use std::path::Path;

use super::hash::HashError;
use super::transaction::{Transaction, TransactionContent};

/// Default RSA modulus size in bits
pub const DEFAULT_KEY_BITS: usize = 1024;

/// Smallest modulus accepted for a wallet key
pub const MIN_KEY_BITS: usize = 1024;

/// Errors that can occur during wallet operations
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Failed to generate keypair: {0}")]
    KeypairGenerationError(String),

    #[error("Failed to sign message: {0}")]
    SigningError(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Public key does not belong to private key")]
    KeyMismatch,

    #[error("Key size {0} is below the minimum of 1024 bits")]
    KeyTooSmall(usize),

    #[error("Malformed key file: {0}")]
    MalformedKeyFile(String),

    #[error("Encoding error: {0}")]
    EncodingError(#[from] HashError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Represents a wallet holding an RSA keypair
///
/// The hex encoded public key doubles as the account identity of the wallet.
#[derive(Clone)]
pub struct Wallet {
    private_key: RsaPrivateKey,
    public_key_hex: String,
    private_key_hex: String,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("public_key", &self.public_key_hex)
            .finish()
    }
}

impl Wallet {
    /// Creates a new wallet with a random keypair of the default size
    pub fn new() -> Result<Self, WalletError> {
        Self::with_key_bits(DEFAULT_KEY_BITS)
    }

    /// Creates a new wallet with a random keypair of `bits` bits
    pub fn with_key_bits(bits: usize) -> Result<Self, WalletError> {
        if bits < MIN_KEY_BITS {
            return Err(WalletError::KeyTooSmall(bits));
        }

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| WalletError::KeypairGenerationError(e.to_string()))?;

        Self::from_private_key(private_key)
    }

    /// Restores a wallet from its hex encoded keys
    ///
    /// # Arguments
    ///
    /// * `public_key` - Hex encoded SubjectPublicKeyInfo DER
    /// * `private_key` - Hex encoded PKCS#8 DER
    pub fn from_hex_keys(public_key: &str, private_key: &str) -> Result<Self, WalletError> {
        let der = hex::decode(private_key.trim())
            .map_err(|e| WalletError::InvalidPrivateKey(e.to_string()))?;
        let private_key = RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| WalletError::InvalidPrivateKey(e.to_string()))?;

        let wallet = Self::from_private_key(private_key)?;
        if wallet.public_key_hex != public_key.trim() {
            return Err(WalletError::KeyMismatch);
        }

        Ok(wallet)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, WalletError> {
        let public_key = RsaPublicKey::from(&private_key);

        let public_der = public_key
            .to_public_key_der()
            .map_err(|e| WalletError::InvalidPublicKey(e.to_string()))?;
        let private_der = private_key
            .to_pkcs8_der()
            .map_err(|e| WalletError::InvalidPrivateKey(e.to_string()))?;

        Ok(Wallet {
            public_key_hex: hex::encode(public_der.as_bytes()),
            private_key_hex: hex::encode(private_der.as_bytes()),
            private_key,
        })
    }

    /// Loads a wallet from a key file: public key on the first line, private key on the second
    pub fn load_keys<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let contents = fs::read_to_string(path)?;
        let mut lines = contents.lines();

        let public_key = lines
            .next()
            .ok_or_else(|| WalletError::MalformedKeyFile("missing public key".to_string()))?;
        let private_key = lines
            .next()
            .ok_or_else(|| WalletError::MalformedKeyFile("missing private key".to_string()))?;

        Self::from_hex_keys(public_key, private_key)
    }

    /// Saves the keys to a file in the format read by [`Wallet::load_keys`]
    pub fn save_keys<P: AsRef<Path>>(&self, path: P) -> Result<(), WalletError> {
        fs::write(path, format!("{}\n{}", self.public_key_hex, self.private_key_hex))?;
        Ok(())
    }

    /// Gets the wallet's public key, which is also its account identity
    pub fn public_key(&self) -> &str {
        &self.public_key_hex
    }

    /// Exports the wallet's private key as hex encoded PKCS#8 DER
    pub fn private_key(&self) -> &str {
        &self.private_key_hex
    }

    /// Signs the content of a transaction with the wallet's private key
    ///
    /// The content is hashed with SHA-256 and signed with RSASSA-PKCS1-v1_5.
    ///
    /// # Returns
    ///
    /// The hex encoded signature
    pub fn sign_transaction(
        &self,
        sender: &str,
        recipient: &str,
        amount: f64,
    ) -> Result<String, WalletError> {
        let message = TransactionContent::new(sender, recipient, amount).to_bytes()?;
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());

        let signature = signing_key
            .try_sign(&message)
            .map_err(|e| WalletError::SigningError(e.to_string()))?;

        Ok(hex::encode(signature.to_vec()))
    }

    /// Verifies that a transaction was signed by the owner of its sender key
    ///
    /// Any decoding failure of the key or signature counts as an invalid signature.
    pub fn verify_transaction(transaction: &Transaction) -> bool {
        match Self::check_signature(transaction) {
            Ok(()) => true,
            Err(err) => {
                debug!("Signature check failed: {}", err);
                false
            }
        }
    }

    fn check_signature(transaction: &Transaction) -> Result<(), WalletError> {
        let public_der = hex::decode(&transaction.sender)
            .map_err(|e| WalletError::InvalidPublicKey(e.to_string()))?;
        let public_key = RsaPublicKey::from_public_key_der(&public_der)
            .map_err(|e| WalletError::InvalidPublicKey(e.to_string()))?;

        let signature_bytes = hex::decode(&transaction.signature)
            .map_err(|e| WalletError::SigningError(e.to_string()))?;
        let signature = Signature::try_from(signature_bytes.as_slice())
            .map_err(|e| WalletError::SigningError(e.to_string()))?;

        let message = transaction.signing_payload()?;
        VerifyingKey::<Sha256>::new(public_key)
            .verify(&message, &signature)
            .map_err(|e| WalletError::SigningError(e.to_string()))
    }
}

/// Wallets shared by tests, generated once per process since RSA key generation is slow
#[cfg(test)]
pub(crate) mod test_support {
    use super::Wallet;
    use std::sync::OnceLock;

    static WALLETS: OnceLock<Vec<Wallet>> = OnceLock::new();

    pub(crate) fn wallet(index: usize) -> &'static Wallet {
        let wallets = WALLETS.get_or_init(|| {
            (0..3).map(|_| Wallet::new().unwrap()).collect()
        });
        &wallets[index]
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::wallet;
    use super::*;

    fn signed(wallet: &Wallet, recipient: &str, amount: f64) -> Transaction {
        let signature = wallet
            .sign_transaction(wallet.public_key(), recipient, amount)
            .unwrap();
        Transaction::new(wallet.public_key(), recipient, signature, amount)
    }

    #[test]
    fn test_wallet_creation() {
        let wallet = wallet(0);
        assert!(!wallet.public_key().is_empty());
        assert!(!wallet.private_key().is_empty());
        assert_ne!(wallet.public_key(), super::test_support::wallet(1).public_key());
    }

    #[test]
    fn test_key_too_small() {
        assert!(matches!(
            Wallet::with_key_bits(512),
            Err(WalletError::KeyTooSmall(512))
        ));
    }

    #[test]
    fn test_signing_and_verification() {
        let alice = wallet(0);
        let transaction = signed(alice, "bob", 5.0);

        assert!(Wallet::verify_transaction(&transaction));
    }

    #[test]
    fn test_verification_fails_after_amount_change() {
        let alice = wallet(0);
        let mut transaction = signed(alice, "bob", 5.0);
        transaction.amount = 50.0;

        assert!(!Wallet::verify_transaction(&transaction));
    }

    #[test]
    fn test_verification_fails_with_other_keypair_signature() {
        let alice = wallet(0);
        let mallory = wallet(1);

        let signature = mallory
            .sign_transaction(alice.public_key(), "bob", 5.0)
            .unwrap();
        let transaction = Transaction::new(alice.public_key(), "bob", signature, 5.0);

        assert!(!Wallet::verify_transaction(&transaction));
    }

    #[test]
    fn test_verification_fails_on_garbage() {
        let transaction = Transaction::new("not-hex", "bob", "zz", 1.0);
        assert!(!Wallet::verify_transaction(&transaction));

        let alice = wallet(0);
        let unsigned = Transaction::new(alice.public_key(), "bob", "", 1.0);
        assert!(!Wallet::verify_transaction(&unsigned));
    }

    #[test]
    fn test_key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.txt");

        let original = wallet(0);
        original.save_keys(&path).unwrap();

        let loaded = Wallet::load_keys(&path).unwrap();
        assert_eq!(loaded.public_key(), original.public_key());
        assert_eq!(loaded.private_key(), original.private_key());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_load_rejects_mismatched_and_short_files() {
        let dir = tempfile::tempdir().unwrap();

        let short = dir.path().join("short.txt");
        std::fs::write(&short, wallet(0).public_key()).unwrap();
        assert!(matches!(
            Wallet::load_keys(&short),
            Err(WalletError::MalformedKeyFile(_))
        ));

        let mismatched = dir.path().join("mismatched.txt");
        std::fs::write(
            &mismatched,
            format!("{}\n{}", wallet(1).public_key(), wallet(0).private_key()),
        )
        .unwrap();
        assert!(matches!(
            Wallet::load_keys(&mismatched),
            Err(WalletError::KeyMismatch)
        ));

        assert!(matches!(
            Wallet::load_keys(dir.path().join("missing.txt")),
            Err(WalletError::Io(_))
        ));
    }
}
