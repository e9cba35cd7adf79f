//! The key-bag capability consumed by the classifier, the signer chain and
//! the coin selector.
//!
//! [`KeyBag`] is deliberately small: the signer chain consumes only this
//! trait, so it can be tested against a stub bag instead of a whole wallet.
//! The default implementation is [`crate::keychain::KeyRegistry`].

use bitcoin::{
    bip32::DerivationPath, hashes::Hash as _, CompressedPublicKey, PubkeyHash,
    Script, ScriptBuf, ScriptHash, WPubkeyHash,
};
use kestrel_common::time::TimestampMs;
use secp256k1::{PublicKey, SecretKey};

/// The script templates the wallet can own outputs under.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ScriptType {
    /// Pay-to-pubkey-hash.
    P2pkh,
    /// Pay-to-witness-pubkey-hash (BIP141 v0).
    P2wpkh,
}

/// A key the wallet can sign (or at least watch) with.
#[derive(Clone, Debug)]
pub struct SigningKey {
    pub pubkey: PublicKey,
    /// `None` for watch-only keys and for encrypted wallets before
    /// decryption.
    pub privkey: Option<SecretKey>,
    /// The full HD path from the master key; recorded on signing proposals
    /// so downstream cosigners can derive the same branch.
    pub path: DerivationPath,
    pub created_at: TimestampMs,
}

impl SigningKey {
    pub fn pubkey_hash(&self) -> PubkeyHash {
        bitcoin::PublicKey::new(self.pubkey).pubkey_hash()
    }

    pub fn wpubkey_hash(&self) -> WPubkeyHash {
        CompressedPublicKey(self.pubkey).wpubkey_hash()
    }

    pub fn script_pubkey(&self, script_type: ScriptType) -> ScriptBuf {
        match script_type {
            ScriptType::P2pkh => ScriptBuf::new_p2pkh(&self.pubkey_hash()),
            ScriptType::P2wpkh => ScriptBuf::new_p2wpkh(&self.wpubkey_hash()),
        }
    }
}

/// Everything needed to satisfy a P2SH scriptPubKey we are party to.
#[derive(Clone, Debug)]
pub struct RedeemData {
    pub redeem_script: ScriptBuf,
    pub keys: Vec<SigningKey>,
}

impl RedeemData {
    pub fn script_hash(&self) -> ScriptHash {
        self.redeem_script.script_hash()
    }
}

/// Read/mark access to the wallet's signing material.
///
/// All methods take `&self`; implementations synchronize internally (the
/// registry's lock nests *inside* the wallet lock, never the reverse).
pub trait KeyBag: Send + Sync {
    fn find_key_by_pubkey(&self, pubkey: &PublicKey) -> Option<SigningKey>;

    fn find_key_by_pubkey_hash(
        &self,
        hash: &[u8; 20],
        script_type: ScriptType,
    ) -> Option<SigningKey>;

    fn find_redeem_data(&self, script_hash: &ScriptHash)
        -> Option<RedeemData>;

    fn is_pubkey_mine(&self, pubkey: &PublicKey) -> bool {
        self.find_key_by_pubkey(pubkey).is_some()
    }

    fn is_pubkey_hash_mine(
        &self,
        hash: &[u8; 20],
        script_type: ScriptType,
    ) -> bool {
        self.find_key_by_pubkey_hash(hash, script_type).is_some()
    }

    fn is_script_hash_mine(&self, script_hash: &ScriptHash) -> bool {
        self.find_redeem_data(script_hash).is_some()
    }

    /// Mark the key as handed out, advancing the deterministic lookahead.
    fn mark_pubkey_used(&self, pubkey: &PublicKey);

    fn mark_script_hash_used(&self, script_hash: &ScriptHash);

    /// The creation time of the oldest key in the bag; the chain download
    /// can skip everything before it.
    fn earliest_key_creation_time(&self) -> TimestampMs;

    // --- Provided: whole-script dispatch --- //

    /// Whether an output paying `script_pubkey` would be ours.
    fn is_mine_script(&self, script_pubkey: &Script) -> bool {
        if let Some(hash) = p2pkh_hash(script_pubkey) {
            self.is_pubkey_hash_mine(&hash, ScriptType::P2pkh)
        } else if let Some(hash) = p2wpkh_hash(script_pubkey) {
            self.is_pubkey_hash_mine(&hash, ScriptType::P2wpkh)
        } else if let Some(script_hash) = p2sh_hash(script_pubkey) {
            self.is_script_hash_mine(&script_hash)
        } else if let Some(pubkey) = p2pk_pubkey(script_pubkey) {
            self.is_pubkey_mine(&pubkey)
        } else {
            false
        }
    }

    /// The signing key controlling `script_pubkey`, if it is ours and not
    /// behind a P2SH redeem script.
    fn find_key_for_script(
        &self,
        script_pubkey: &Script,
    ) -> Option<SigningKey> {
        if let Some(hash) = p2pkh_hash(script_pubkey) {
            self.find_key_by_pubkey_hash(&hash, ScriptType::P2pkh)
        } else if let Some(hash) = p2wpkh_hash(script_pubkey) {
            self.find_key_by_pubkey_hash(&hash, ScriptType::P2wpkh)
        } else if let Some(pubkey) = p2pk_pubkey(script_pubkey) {
            self.find_key_by_pubkey(&pubkey)
        } else {
            None
        }
    }

    /// Mark whatever key controls `script_pubkey` as used.
    fn mark_script_used(&self, script_pubkey: &Script) {
        if let Some(key) = self.find_key_for_script(script_pubkey) {
            self.mark_pubkey_used(&key.pubkey);
        } else if let Some(script_hash) = p2sh_hash(script_pubkey) {
            if self.is_script_hash_mine(&script_hash) {
                self.mark_script_hash_used(&script_hash);
            }
        }
    }
}

// --- Script template extraction helpers --- //

/// The pushed pubkey hash of a P2PKH scriptPubKey.
pub fn p2pkh_hash(script: &Script) -> Option<[u8; 20]> {
    if !script.is_p2pkh() {
        return None;
    }
    // OP_DUP OP_HASH160 <push 20> [20 bytes] OP_EQUALVERIFY OP_CHECKSIG
    script.as_bytes()[3..23].try_into().ok()
}

/// The pushed witness program of a P2WPKH scriptPubKey.
pub fn p2wpkh_hash(script: &Script) -> Option<[u8; 20]> {
    if !script.is_p2wpkh() {
        return None;
    }
    // OP_0 <push 20> [20 bytes]
    script.as_bytes()[2..22].try_into().ok()
}

/// The pushed script hash of a P2SH scriptPubKey.
pub fn p2sh_hash(script: &Script) -> Option<ScriptHash> {
    if !script.is_p2sh() {
        return None;
    }
    // OP_HASH160 <push 20> [20 bytes] OP_EQUAL
    let bytes: [u8; 20] = script.as_bytes()[2..22].try_into().ok()?;
    Some(ScriptHash::from_byte_array(bytes))
}

/// The raw pubkey of a P2PK scriptPubKey.
pub fn p2pk_pubkey(script: &Script) -> Option<PublicKey> {
    script.p2pk_public_key().map(|pubkey| pubkey.inner)
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_key() -> SigningKey {
        let privkey = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let secp = secp256k1::Secp256k1::new();
        SigningKey {
            pubkey: privkey.public_key(&secp),
            privkey: Some(privkey),
            path: DerivationPath::master(),
            created_at: TimestampMs::MIN,
        }
    }

    #[test]
    fn extraction_roundtrips_through_script_construction() {
        let key = test_key();

        let p2pkh = key.script_pubkey(ScriptType::P2pkh);
        assert_eq!(
            p2pkh_hash(&p2pkh),
            Some(key.pubkey_hash().to_byte_array())
        );
        assert_eq!(p2wpkh_hash(&p2pkh), None);

        let p2wpkh = key.script_pubkey(ScriptType::P2wpkh);
        assert_eq!(
            p2wpkh_hash(&p2wpkh),
            Some(key.wpubkey_hash().to_byte_array())
        );
        assert_eq!(p2pkh_hash(&p2wpkh), None);

        // The two hashes agree: both are HASH160 of the compressed pubkey.
        assert_eq!(
            key.pubkey_hash().to_byte_array(),
            key.wpubkey_hash().to_byte_array()
        );
    }

    #[test]
    fn p2sh_hash_extraction() {
        let redeem = RedeemData {
            redeem_script: ScriptBuf::from_bytes(vec![0x51]), // OP_TRUE
            keys: vec![],
        };
        let spk = ScriptBuf::new_p2sh(&redeem.script_hash());
        assert_eq!(p2sh_hash(&spk), Some(redeem.script_hash()));
    }
}
