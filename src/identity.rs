//! Long-term device identity.
//!
//! The identity is an Ed25519 signing keypair whose public key derives the
//! device's overlay address (see [`crate::crypto::pubkey_to_addr`]). The
//! keypair is immutable once created and only regenerated if the stored
//! identity file is missing or fails validation.

use anyhow::{bail, Context, Result};
use ed25519_dalek::SigningKey;
use log::{info, warn};
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};

use crate::addr::DeviceAddr;
use crate::crypto::{self, PUBKEY_LEN, SIGNATURE_LEN};
use crate::util::{decode_hex, encode_hex};

const DEFAULT_IDENTITY_DIR: &str = ".tunnelmesh";
const IDENTITY_FILE: &str = "id";

/// Local device identity: signing keypair plus the derived overlay address.
pub struct Identity {
    signing: SigningKey,
    address: DeviceAddr,
}

impl Identity {
    /// Generates a fresh identity, looping keypair generation until one
    /// satisfies the address work constraint. Converges after ~1300
    /// attempts on average.
    pub fn create() -> Self {
        loop {
            let signing = SigningKey::generate(&mut OsRng);
            if let Some(address) = crypto::pubkey_to_addr(&signing.verifying_key().to_bytes()) {
                return Identity { signing, address };
            }
        }
    }

    fn from_keypair_bytes(bytes: &[u8; 64]) -> Result<Self> {
        let signing =
            SigningKey::from_keypair_bytes(bytes).context("invalid identity keypair bytes")?;
        let Some(address) = crypto::pubkey_to_addr(&signing.verifying_key().to_bytes()) else {
            bail!("public key does not derive a valid overlay address");
        };
        Ok(Identity { signing, address })
    }

    /// Re-checks the address derivation. Fails only for identities built
    /// from corrupted or hand-edited key material.
    pub fn is_valid(&self) -> bool {
        crypto::pubkey_to_addr(&self.public_key()) == Some(self.address)
    }

    pub fn address(&self) -> DeviceAddr {
        self.address
    }

    pub fn public_key(&self) -> [u8; PUBKEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, domain: &str, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        crypto::sign(&self.signing, domain, data)
    }

    /// Default identity file location (`~/.tunnelmesh/id`).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_IDENTITY_DIR)
            .join(IDENTITY_FILE)
    }

    /// Loads an identity from disk. The file holds one line:
    /// `<address> <pubkey-hex> <keypair-hex>`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read identity from {:?}", path))?;
        let mut parts = content.split_whitespace();
        let (Some(addr_str), Some(pubkey_hex), Some(keypair_hex)) =
            (parts.next(), parts.next(), parts.next())
        else {
            bail!("identity file is malformed");
        };

        let keypair = decode_hex(keypair_hex).context("keypair field is not valid hex")?;
        let keypair: [u8; 64] = keypair
            .try_into()
            .map_err(|_| anyhow::anyhow!("keypair field has wrong length"))?;
        let identity = Self::from_keypair_bytes(&keypair)?;

        // The stored address and pubkey are redundant with the keypair;
        // a mismatch means the file was corrupted or spliced together.
        let stored_addr: std::net::Ipv6Addr =
            addr_str.parse().context("address field is not an IPv6 address")?;
        if DeviceAddr::from_ipv6(stored_addr) != identity.address {
            bail!("stored address does not match the keypair");
        }
        if decode_hex(pubkey_hex).as_deref() != Some(identity.public_key().as_slice()) {
            bail!("stored public key does not match the keypair");
        }

        info!("loaded identity {} from {:?}", identity.address, path);
        Ok(identity)
    }

    /// Persists the identity with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("failed to create identity directory")?;
        }

        let line = format!(
            "{} {} {}\n",
            self.address,
            encode_hex(&self.public_key()),
            encode_hex(&self.signing.to_keypair_bytes()),
        );
        fs::write(path, line).with_context(|| format!("failed to write identity to {:?}", path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        info!("saved identity {} to {:?}", self.address, path);
        Ok(())
    }

    /// Loads the stored identity, generating and persisting a new one when
    /// the file is missing or invalid.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(identity) => Ok(identity),
            Err(e) => {
                warn!("no usable identity ({}), generating a new one", e);
                let identity = Self::create();
                identity.save(path)?;
                Ok(identity)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_identity_is_valid() {
        let identity = Identity::create();
        assert!(identity.is_valid());
        assert!(identity.address().is_overlay());
    }

    #[test]
    fn file_round_trip() {
        let dir = std::env::temp_dir().join(format!("tunnelmesh-id-{}", std::process::id()));
        let path = dir.join("id");
        let identity = Identity::create();
        identity.save(&path).unwrap();

        let loaded = Identity::load(&path).unwrap();
        assert_eq!(loaded.address(), identity.address());
        assert_eq!(loaded.public_key(), identity.public_key());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corrupted_file_is_regenerated() {
        let dir = std::env::temp_dir().join(format!("tunnelmesh-id-bad-{}", std::process::id()));
        let path = dir.join("id");
        fs::create_dir_all(&dir).unwrap();
        fs::write(&path, "fc94::1 deadbeef deadbeef\n").unwrap();

        let identity = Identity::load_or_generate(&path).unwrap();
        assert!(identity.is_valid());
        // The new identity must have been persisted over the bad file.
        let reloaded = Identity::load(&path).unwrap();
        assert_eq!(reloaded.address(), identity.address());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn signature_matches_domain() {
        let identity = Identity::create();
        let sig = identity.sign(crypto::P2P_MSG_DOMAIN, b"hello");
        assert!(crypto::verify(
            &identity.public_key(),
            crypto::P2P_MSG_DOMAIN,
            b"hello",
            &sig
        ));
    }
}
