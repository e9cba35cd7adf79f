//! Deterministic key chains and the wallet's key registry.
//!
//! The registry is the wallet's default [`KeyBag`]: it owns one or more
//! BIP32 chains derived from a single BIP39 seed, indexes every derived
//! pubkey/pubkey-hash for O(1) ownership checks, maintains a lookahead zone
//! ahead of the last issued key so network filters catch payments to keys
//! we haven't handed out yet, and supports sealing the seed at rest.
//!
//! Locking: the registry lock nests *inside* the wallet lock. External
//! consumers (e.g. a filter provider) may take the registry lock alone via
//! [`KeyRegistry::watched_scripts`], which snapshots without holding up the
//! wallet.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::Mutex,
};

use bip39::Mnemonic;
use bitcoin::{
    bip32::{ChildNumber, DerivationPath, Xpriv, Xpub},
    hashes::Hash as _,
    ScriptBuf, ScriptHash,
};
use kestrel_common::{network::KsNetwork, time::TimestampMs};
use rand_core::RngCore;
use secp256k1::{All, PublicKey, Secp256k1};
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    constants::DEFAULT_LOOKAHEAD,
    crypt::{self, SealedBlob},
    error::{KeyCryptoError, MaintenanceError},
    keys::{KeyBag, RedeemData, ScriptType, SigningKey},
};

/// How account paths are laid out under the master key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AccountStructure {
    /// The legacy layout: account n lives directly at `m/{1+n}'`.
    Bip32,
    /// Purpose-scoped layout: `m/{purpose}'/{coin}'/{account}'` with the
    /// purpose determined by the script type (BIP44 / BIP84).
    Bip43,
}

/// The hardened account path for the given layout, script type, network and
/// account index.
pub fn account_path(
    structure: AccountStructure,
    script_type: ScriptType,
    network: KsNetwork,
    account_index: u32,
) -> DerivationPath {
    let hardened = |index: u32| {
        ChildNumber::from_hardened_idx(index)
            .expect("account indexes are small")
    };
    let path = match structure {
        AccountStructure::Bip43 => {
            let purpose = match script_type {
                ScriptType::P2pkh => 44,
                ScriptType::P2wpkh => 84,
            };
            vec![
                hardened(purpose),
                hardened(network.bip44_coin_type()),
                hardened(account_index),
            ]
        }
        AccountStructure::Bip32 => vec![hardened(1 + account_index)],
    };
    DerivationPath::from(path)
}

/// External (receive) branch index under the account.
pub const EXTERNAL_BRANCH: u32 = 0;
/// Internal (change) branch index under the account.
pub const INTERNAL_BRANCH: u32 = 1;

#[derive(Clone, Debug)]
struct Branch {
    xpub: Xpub,
    /// Number of keys handed out (or observed used) on this branch.
    issued: u32,
    /// Index of the current (last handed out, still unused) key.
    current: Option<u32>,
    /// Derived pubkeys, index-ordered, covering `0..issued + lookahead`.
    derived: Vec<PublicKey>,
}

/// One BIP32 account chain.
#[derive(Clone, Debug)]
struct Chain {
    account_index: u32,
    account_path: DerivationPath,
    account_xpub: Xpub,
    /// `None` while the wallet is encrypted (or watch-only).
    account_xprv: Option<Xpriv>,
    script_type: ScriptType,
    created_at: TimestampMs,
    branches: [Branch; 2],
}

impl Chain {
    fn new(
        secp: &Secp256k1<All>,
        account_xprv: Xpriv,
        account_index: u32,
        account_path: DerivationPath,
        script_type: ScriptType,
        created_at: TimestampMs,
    ) -> Self {
        let account_xpub = Xpub::from_priv(secp, &account_xprv);
        let branch = |index: u32| {
            let child = ChildNumber::from_normal_idx(index)
                .expect("branch indexes are 0 or 1");
            Branch {
                xpub: account_xpub
                    .derive_pub(secp, &[child])
                    .expect("pubkey derivation cannot fail for normal children"),
                issued: 0,
                current: None,
                derived: Vec::new(),
            }
        };
        Self {
            account_index,
            account_path,
            account_xpub,
            account_xprv: Some(account_xprv),
            script_type,
            created_at,
            branches: [branch(EXTERNAL_BRANCH), branch(INTERNAL_BRANCH)],
        }
    }

    /// Full HD path of the key at (branch, index).
    fn key_path(&self, branch: u32, index: u32) -> DerivationPath {
        self.account_path.extend([
            ChildNumber::from_normal_idx(branch).expect("in range"),
            ChildNumber::from_normal_idx(index).expect("in range"),
        ])
    }

    fn derive_privkey(
        &self,
        secp: &Secp256k1<All>,
        branch: u32,
        index: u32,
    ) -> Option<secp256k1::SecretKey> {
        let xprv = self.account_xprv.as_ref()?;
        let path = [
            ChildNumber::from_normal_idx(branch).expect("in range"),
            ChildNumber::from_normal_idx(index).expect("in range"),
        ];
        let child = xprv
            .derive_priv(secp, &path)
            .expect("privkey derivation cannot fail for normal children");
        Some(child.private_key)
    }
}

/// Where a derived key lives.
#[derive(Copy, Clone, Debug)]
struct KeyLoc {
    chain: usize,
    branch: u32,
    index: u32,
}

/// Bookkeeping effects the wallet turns into listener events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeyEvent {
    /// The lookahead zone grew by this many keys; filters must be rebuilt.
    KeysAdded(u32),
    /// The current receive key was consumed and will be replaced.
    CurrentKeyChanged,
}

struct Inner {
    network: KsNetwork,
    structure: AccountStructure,
    /// BIP39 seed bytes; `None` while encrypted. Wrapped so the seed
    /// never leaks through `Debug` output and is zeroized on drop.
    seed: Option<SecretVec<u8>>,
    sealed_seed: Option<SealedBlob>,
    chains: Vec<Chain>,
    by_pubkey: HashMap<PublicKey, KeyLoc>,
    /// HASH160(pubkey) → location; shared by P2PKH and P2WPKH lookups.
    by_hash: HashMap<[u8; 20], KeyLoc>,
    redeem: HashMap<ScriptHash, RedeemData>,
    events: Vec<KeyEvent>,
}

/// The wallet's key registry. See the module docs.
pub struct KeyRegistry {
    secp: Secp256k1<All>,
    inner: Mutex<Inner>,
}

impl KeyRegistry {
    /// Create a registry from a BIP39 mnemonic with a single account chain
    /// at account index 0.
    pub fn from_mnemonic(
        mnemonic: &Mnemonic,
        structure: AccountStructure,
        script_type: ScriptType,
        network: KsNetwork,
        now: TimestampMs,
    ) -> Self {
        let seed = mnemonic.to_seed("").to_vec();
        Self::from_seed(seed, structure, script_type, network, now)
    }

    pub fn from_seed(
        seed: Vec<u8>,
        structure: AccountStructure,
        script_type: ScriptType,
        network: KsNetwork,
        now: TimestampMs,
    ) -> Self {
        let secp = Secp256k1::new();
        let mut inner = Inner {
            network,
            structure,
            seed: Some(SecretVec::new(seed)),
            sealed_seed: None,
            chains: Vec::new(),
            by_pubkey: HashMap::new(),
            by_hash: HashMap::new(),
            redeem: HashMap::new(),
            events: Vec::new(),
        };
        inner
            .add_chain(&secp, script_type, now)
            .expect("seed is present at construction");
        // Chain synthesis is not a listener-visible event at construction.
        inner.events.clear();
        Self { secp, inner: Mutex::new(inner) }
    }

    /// The account path of the active (most recent) chain.
    pub fn active_account_path(&self) -> DerivationPath {
        let locked = self.inner.lock().unwrap();
        locked.active_chain().account_path.clone()
    }

    pub fn network(&self) -> KsNetwork {
        self.inner.lock().unwrap().network
    }

    pub fn script_type(&self) -> ScriptType {
        self.inner.lock().unwrap().active_chain().script_type
    }

    /// Drain bookkeeping events accumulated since the last call.
    pub fn take_events(&self) -> Vec<KeyEvent> {
        std::mem::take(&mut self.inner.lock().unwrap().events)
    }

    // --- Addresses --- //

    /// The current receive script: stable until the key is observed used.
    pub fn current_receive_script(&self) -> ScriptBuf {
        self.key_script(EXTERNAL_BRANCH, false)
    }

    /// Issues a brand new receive script, replacing the current one.
    pub fn fresh_receive_script(&self) -> ScriptBuf {
        self.key_script(EXTERNAL_BRANCH, true)
    }

    /// The current change script.
    pub fn current_change_script(&self) -> ScriptBuf {
        self.key_script(INTERNAL_BRANCH, false)
    }

    fn key_script(&self, branch: u32, fresh: bool) -> ScriptBuf {
        let mut locked = self.inner.lock().unwrap();
        let chain_idx = locked.chains.len() - 1;
        let (pubkey, script_type) =
            locked.issue_key(&self.secp, chain_idx, branch, fresh);
        SigningKey {
            pubkey,
            privkey: None,
            path: DerivationPath::master(),
            created_at: TimestampMs::MIN,
        }
        .script_pubkey(script_type)
    }

    // --- Encryption at rest --- //

    pub fn is_encrypted(&self) -> bool {
        let locked = self.inner.lock().unwrap();
        locked.sealed_seed.is_some() && locked.seed.is_none()
    }

    /// Seal the seed under `password` and drop all private key material.
    pub fn encrypt(
        &self,
        rng: &mut dyn RngCore,
        password: &str,
    ) -> Result<(), KeyCryptoError> {
        let mut locked = self.inner.lock().unwrap();
        if locked.sealed_seed.is_some() {
            return Err(KeyCryptoError::AlreadyEncrypted);
        }
        let seed = locked.seed.take().expect("unencrypted wallets hold a seed");
        locked.sealed_seed =
            Some(crypt::seal(rng, password, seed.expose_secret()));
        for chain in &mut locked.chains {
            chain.account_xprv = None;
        }
        info!("Wallet key material encrypted at rest");
        Ok(())
    }

    /// Unseal the seed and re-derive every chain's private key material.
    pub fn decrypt(&self, password: &str) -> Result<(), KeyCryptoError> {
        let mut locked = self.inner.lock().unwrap();
        let sealed = match &locked.sealed_seed {
            Some(sealed) => sealed,
            None => return Err(KeyCryptoError::NotEncrypted),
        };
        let seed = SecretVec::new(crypt::open(password, sealed)?);
        let master = master_xprv(locked.network, seed.expose_secret());
        for chain in &mut locked.chains {
            let account_xprv = master
                .derive_priv(&self.secp, &chain.account_path)
                .expect("derivation cannot fail");
            chain.account_xprv = Some(account_xprv);
        }
        locked.seed = Some(seed);
        locked.sealed_seed = None;
        info!("Wallet key material decrypted");
        Ok(())
    }

    // --- Rotation support --- //

    /// Whether the key controlling `script_pubkey` was created before the
    /// rotation threshold.
    pub fn is_script_rotating(
        &self,
        script_pubkey: &bitcoin::Script,
        threshold: TimestampMs,
    ) -> bool {
        let key = match self.find_key_for_script(script_pubkey) {
            Some(key) => key,
            None => return false,
        };
        key.created_at < threshold
    }

    pub fn all_chains_rotating(&self, threshold: TimestampMs) -> bool {
        let locked = self.inner.lock().unwrap();
        locked.chains.iter().all(|chain| chain.created_at < threshold)
    }

    /// Synthesize a fresh chain at the next account index so rotated funds
    /// have somewhere to go. Encrypted wallets require the password.
    pub fn add_fresh_chain(
        &self,
        now: TimestampMs,
        password: Option<&str>,
    ) -> Result<(), MaintenanceError> {
        let mut locked = self.inner.lock().unwrap();
        let script_type = locked.active_chain().script_type;
        if locked.seed.is_some() {
            locked
                .add_chain(&self.secp, script_type, now)
                .expect("seed is present");
            return Ok(());
        }
        let sealed = locked
            .sealed_seed
            .clone()
            .expect("a wallet without a plaintext seed is encrypted");
        let password = password
            .ok_or(MaintenanceError::KeyRotationRequiresPassword)?;
        let seed = SecretVec::new(
            crypt::open(password, &sealed)
                .map_err(|_| MaintenanceError::KeyRotationRequiresPassword)?,
        );
        locked.add_chain_from_seed(
            &self.secp,
            seed.expose_secret(),
            script_type,
            now,
        );
        // The new chain stays sealed like the rest of the wallet.
        if let Some(chain) = locked.chains.last_mut() {
            chain.account_xprv = None;
        }
        Ok(())
    }

    // --- Filter support --- //

    /// Snapshot of every script the network layer should watch. Takes only
    /// the registry lock, so a filter rebuild doesn't block the wallet.
    pub fn watched_scripts(&self) -> Vec<ScriptBuf> {
        let locked = self.inner.lock().unwrap();
        let mut scripts = Vec::new();
        for chain in &locked.chains {
            for branch in &chain.branches {
                for pubkey in &branch.derived {
                    let key = SigningKey {
                        pubkey: *pubkey,
                        privkey: None,
                        path: DerivationPath::master(),
                        created_at: chain.created_at,
                    };
                    scripts.push(key.script_pubkey(chain.script_type));
                }
            }
        }
        for redeem in locked.redeem.values() {
            scripts.push(ScriptBuf::new_p2sh(&redeem.script_hash()));
        }
        scripts
    }

    /// Register redeem data for a P2SH output we are party to.
    pub fn add_redeem_data(&self, redeem: RedeemData) {
        let mut locked = self.inner.lock().unwrap();
        locked.redeem.insert(redeem.script_hash(), redeem);
    }

    // --- Persistence --- //

    pub fn snapshot(&self) -> KeyRegistrySnapshot {
        let locked = self.inner.lock().unwrap();
        KeyRegistrySnapshot {
            structure: locked.structure,
            network: locked.network,
            seed: locked
                .seed
                .as_ref()
                .map(|seed| seed.expose_secret().clone()),
            sealed_seed: locked.sealed_seed.clone(),
            chains: locked
                .chains
                .iter()
                .map(|chain| ChainSnapshot {
                    account_index: chain.account_index,
                    account_xpub: chain.account_xpub.to_string(),
                    script_type: chain.script_type,
                    created_at: chain.created_at,
                    issued: [
                        chain.branches[0].issued,
                        chain.branches[1].issued,
                    ],
                    current: [
                        chain.branches[0].current,
                        chain.branches[1].current,
                    ],
                })
                .collect(),
        }
    }

    pub fn restore(
        snapshot: KeyRegistrySnapshot,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let secp = Secp256k1::new();
        let master = snapshot
            .seed
            .as_deref()
            .map(|seed| master_xprv(snapshot.network, seed));

        let mut inner = Inner {
            network: snapshot.network,
            structure: snapshot.structure,
            seed: snapshot.seed.map(SecretVec::new),
            sealed_seed: snapshot.sealed_seed,
            chains: Vec::new(),
            by_pubkey: HashMap::new(),
            by_hash: HashMap::new(),
            redeem: HashMap::new(),
            events: Vec::new(),
        };

        for chain_snapshot in snapshot.chains {
            let path = account_path(
                inner.structure,
                chain_snapshot.script_type,
                inner.network,
                chain_snapshot.account_index,
            );
            let account_xpub = Xpub::from_str(&chain_snapshot.account_xpub)
                .context("Bad account xpub in wallet snapshot")?;
            let account_xprv = master.as_ref().map(|master| {
                master
                    .derive_priv(&secp, &path)
                    .expect("derivation cannot fail")
            });
            let branch = |index: u32| {
                let child = ChildNumber::from_normal_idx(index)
                    .expect("in range");
                Branch {
                    xpub: account_xpub
                        .derive_pub(&secp, &[child])
                        .expect("pubkey derivation cannot fail"),
                    issued: chain_snapshot.issued[index as usize],
                    current: chain_snapshot.current[index as usize],
                    derived: Vec::new(),
                }
            };
            let chain = Chain {
                account_index: chain_snapshot.account_index,
                account_path: path,
                account_xpub,
                account_xprv,
                script_type: chain_snapshot.script_type,
                created_at: chain_snapshot.created_at,
                branches: [branch(EXTERNAL_BRANCH), branch(INTERNAL_BRANCH)],
            };
            inner.chains.push(chain);
            let chain_idx = inner.chains.len() - 1;
            inner.maintain_lookahead(&secp, chain_idx);
        }
        inner.events.clear();

        Ok(Self { secp, inner: Mutex::new(inner) })
    }
}

fn master_xprv(network: KsNetwork, seed: &[u8]) -> Xpriv {
    Xpriv::new_master(network.to_bitcoin(), seed)
        .expect("seed length is valid")
}

impl Inner {
    fn active_chain(&self) -> &Chain {
        self.chains.last().expect("registries have at least one chain")
    }

    fn add_chain(
        &mut self,
        secp: &Secp256k1<All>,
        script_type: ScriptType,
        now: TimestampMs,
    ) -> Result<(), ()> {
        // Take the seed out for the duration of the derivation rather
        // than cloning secret bytes around.
        let seed = self.seed.take().ok_or(())?;
        self.add_chain_from_seed(secp, seed.expose_secret(), script_type, now);
        self.seed = Some(seed);
        Ok(())
    }

    fn add_chain_from_seed(
        &mut self,
        secp: &Secp256k1<All>,
        seed: &[u8],
        script_type: ScriptType,
        now: TimestampMs,
    ) {
        let account_index = self.chains.len() as u32;
        let path =
            account_path(self.structure, script_type, self.network, account_index);
        let master = master_xprv(self.network, seed);
        let account_xprv = master
            .derive_priv(secp, &path)
            .expect("derivation cannot fail");
        debug!(account = %path, "Adding deterministic chain");
        let chain = Chain::new(
            secp,
            account_xprv,
            account_index,
            path,
            script_type,
            now,
        );
        self.chains.push(chain);
        let chain_idx = self.chains.len() - 1;
        self.maintain_lookahead(secp, chain_idx);
    }

    /// Ensure `derived` covers `issued + DEFAULT_LOOKAHEAD` keys on both
    /// branches of `chain_idx`, indexing the new ones.
    fn maintain_lookahead(&mut self, secp: &Secp256k1<All>, chain_idx: usize) {
        let mut added = 0u32;
        for branch_idx in [EXTERNAL_BRANCH, INTERNAL_BRANCH] {
            let chain = &self.chains[chain_idx];
            let branch = &chain.branches[branch_idx as usize];
            let target = branch.issued + DEFAULT_LOOKAHEAD;
            let start = branch.derived.len() as u32;

            let mut new_keys = Vec::new();
            for index in start..target {
                let child = ChildNumber::from_normal_idx(index)
                    .expect("key indexes stay in range");
                let pubkey = branch
                    .xpub
                    .derive_pub(secp, &[child])
                    .expect("pubkey derivation cannot fail")
                    .public_key;
                new_keys.push((index, pubkey));
            }

            for (index, pubkey) in new_keys {
                let loc = KeyLoc { chain: chain_idx, branch: branch_idx, index };
                self.by_pubkey.insert(pubkey, loc);
                let hash = bitcoin::PublicKey::new(pubkey)
                    .pubkey_hash()
                    .to_byte_array();
                self.by_hash.insert(hash, loc);
                self.chains[chain_idx].branches[branch_idx as usize]
                    .derived
                    .push(pubkey);
                added += 1;
            }
        }
        if added > 0 {
            self.events.push(KeyEvent::KeysAdded(added));
        }
    }

    /// Hand out the current (or a fresh) key on a branch.
    fn issue_key(
        &mut self,
        secp: &Secp256k1<All>,
        chain_idx: usize,
        branch_idx: u32,
        fresh: bool,
    ) -> (PublicKey, ScriptType) {
        let chain = &mut self.chains[chain_idx];
        let script_type = chain.script_type;
        let branch = &mut chain.branches[branch_idx as usize];

        let index = match branch.current {
            Some(current) if !fresh => current,
            _ => {
                let index = branch.issued;
                branch.issued += 1;
                branch.current = Some(index);
                if branch_idx == EXTERNAL_BRANCH {
                    self.events.push(KeyEvent::CurrentKeyChanged);
                }
                index
            }
        };

        self.maintain_lookahead(secp, chain_idx);
        let pubkey =
            self.chains[chain_idx].branches[branch_idx as usize].derived
                [index as usize];
        (pubkey, script_type)
    }

    fn signing_key(&self, secp: &Secp256k1<All>, loc: KeyLoc) -> SigningKey {
        let chain = &self.chains[loc.chain];
        let pubkey = chain.branches[loc.branch as usize].derived
            [loc.index as usize];
        SigningKey {
            pubkey,
            privkey: chain.derive_privkey(secp, loc.branch, loc.index),
            path: chain.key_path(loc.branch, loc.index),
            created_at: chain.created_at,
        }
    }

    fn mark_used(&mut self, secp: &Secp256k1<All>, loc: KeyLoc) {
        let chain = &mut self.chains[loc.chain];
        let branch = &mut chain.branches[loc.branch as usize];
        if loc.index >= branch.issued {
            branch.issued = loc.index + 1;
        }
        if branch.current == Some(loc.index) {
            branch.current = None;
            if loc.branch == EXTERNAL_BRANCH {
                self.events.push(KeyEvent::CurrentKeyChanged);
            }
        }
        self.maintain_lookahead(secp, loc.chain);
    }
}

impl KeyBag for KeyRegistry {
    fn find_key_by_pubkey(&self, pubkey: &PublicKey) -> Option<SigningKey> {
        let locked = self.inner.lock().unwrap();
        let loc = *locked.by_pubkey.get(pubkey)?;
        Some(locked.signing_key(&self.secp, loc))
    }

    fn find_key_by_pubkey_hash(
        &self,
        hash: &[u8; 20],
        script_type: ScriptType,
    ) -> Option<SigningKey> {
        let locked = self.inner.lock().unwrap();
        let loc = *locked.by_hash.get(hash)?;
        if locked.chains[loc.chain].script_type != script_type {
            return None;
        }
        Some(locked.signing_key(&self.secp, loc))
    }

    fn find_redeem_data(
        &self,
        script_hash: &ScriptHash,
    ) -> Option<RedeemData> {
        let locked = self.inner.lock().unwrap();
        locked.redeem.get(script_hash).cloned()
    }

    fn mark_pubkey_used(&self, pubkey: &PublicKey) {
        let mut locked = self.inner.lock().unwrap();
        if let Some(loc) = locked.by_pubkey.get(pubkey).copied() {
            locked.mark_used(&self.secp, loc);
        }
    }

    fn mark_script_hash_used(&self, script_hash: &ScriptHash) {
        // Redeem data is registered explicitly; there is no lookahead to
        // advance, but the call keeps the capability uniform.
        let locked = self.inner.lock().unwrap();
        let _ = locked.redeem.contains_key(script_hash);
    }

    fn earliest_key_creation_time(&self) -> TimestampMs {
        let locked = self.inner.lock().unwrap();
        locked
            .chains
            .iter()
            .map(|chain| chain.created_at)
            .min()
            .unwrap_or(TimestampMs::MIN)
    }
}

/// Serializable registry state; the seed (sealed or not) plus per-chain
/// issuance counters. Derived keys are re-derived on restore.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyRegistrySnapshot {
    pub structure: AccountStructure,
    pub network: KsNetwork,
    pub seed: Option<Vec<u8>>,
    pub sealed_seed: Option<SealedBlob>,
    pub chains: Vec<ChainSnapshot>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub account_index: u32,
    pub account_xpub: String,
    pub script_type: ScriptType,
    pub created_at: TimestampMs,
    pub issued: [u32; 2],
    pub current: [Option<u32>; 2],
}
