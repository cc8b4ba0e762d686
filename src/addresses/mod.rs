//! Gap-limited address chains
//!
//! An account has two chains below its xpub: receive (`0`) and change (`1`). Each chain is
//! extended on demand so that its tail always holds `gap_limit` unused addresses. An address
//! counts as used once the indexer reported a non-empty history for it.

pub mod account_address;

use std::collections::HashMap;

use bitcoin::bip32::{DerivationPath, Xpub};
use bitcoin::Network;
use tracing::debug;

pub use account_address::{AccountAddress, Derivation};

use crate::data_structures::{ScriptHashHex, ScriptType};
use crate::errors::{WalletError, WalletResult};

/// Addresses derived from `xpub/<chain_index>/*`.
#[derive(Debug, Clone)]
pub struct AddressChain {
    xpub: Xpub,
    account_keypath: DerivationPath,
    script_type: ScriptType,
    network: Network,
    gap_limit: usize,
    change: bool,
    addresses: Vec<AccountAddress>,
    lookup: HashMap<ScriptHashHex, usize>,
}

impl AddressChain {
    pub fn new(
        xpub: Xpub,
        account_keypath: DerivationPath,
        script_type: ScriptType,
        network: Network,
        gap_limit: u16,
        change: bool,
    ) -> Self {
        Self {
            xpub,
            account_keypath,
            script_type,
            network,
            gap_limit: usize::from(gap_limit),
            change,
            addresses: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    pub fn gap_limit(&self) -> usize {
        self.gap_limit
    }

    pub fn is_change(&self) -> bool {
        self.change
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn addresses(&self) -> &[AccountAddress] {
        &self.addresses
    }

    fn unused_tail_count(&self) -> usize {
        self.addresses
            .iter()
            .rev()
            .take_while(|address| !address.is_used())
            .count()
    }

    /// Appends addresses until the unused tail reaches the gap limit. Returns the new ones.
    pub fn ensure_addresses(&mut self) -> WalletResult<Vec<AccountAddress>> {
        let unused = self.unused_tail_count();
        let missing = self.gap_limit.saturating_sub(unused);
        let mut added = Vec::with_capacity(missing);
        for _ in 0..missing {
            added.push(self.add_address()?.clone());
        }
        if !added.is_empty() {
            debug!(
                chain = u32::from(self.change),
                added = added.len(),
                total = self.addresses.len(),
                "extended address chain"
            );
        }
        Ok(added)
    }

    fn add_address(&mut self) -> WalletResult<&AccountAddress> {
        let index = u32::try_from(self.addresses.len())
            .map_err(|_| WalletError::InternalError("address chain exhausted".to_string()))?;
        let address = AccountAddress::derive(
            &self.xpub,
            &self.account_keypath,
            self.script_type,
            Derivation {
                change: self.change,
                address_index: index,
            },
            self.network,
        )?;
        self.lookup
            .insert(address.script_hash().clone(), self.addresses.len());
        self.addresses.push(address);
        Ok(&self.addresses[self.addresses.len() - 1])
    }

    /// The unused tail of the chain. Fails if the chain has not been extended since an address
    /// was last marked used.
    pub fn get_unused(&self) -> WalletResult<&[AccountAddress]> {
        let unused = self.unused_tail_count();
        if unused < self.gap_limit {
            return Err(WalletError::InternalError(
                "addresses not synced, ensure_addresses must run first".to_string(),
            ));
        }
        Ok(&self.addresses[self.addresses.len() - unused..])
    }

    pub fn lookup_by_script_hash(&self, script_hash: &ScriptHashHex) -> Option<&AccountAddress> {
        self.lookup
            .get(script_hash)
            .map(|&index| &self.addresses[index])
    }

    /// Updates the stored history status of an address. Returns false if the address is not
    /// part of this chain.
    pub fn set_history_status(&mut self, script_hash: &ScriptHashHex, status: String) -> bool {
        match self.lookup.get(script_hash) {
            Some(&index) => {
                self.addresses[index].history_status = status;
                true
            }
            None => false,
        }
    }
}
