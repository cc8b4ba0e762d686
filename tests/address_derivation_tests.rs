//! Address derivation against published test vectors

use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Xpub};
use bitcoin::Network;

use lightweight_btc_wallet::addresses::AddressChain;
use lightweight_btc_wallet::data_structures::{ScriptHashHex, ScriptType};

/// BIP86 account xpub of the mnemonic "abandon ... about", m/86'/0'/0'.
const BIP86_XPUB: &str = "xpub6BgBgsespWvERF3LHQu6CnqdvfEvtMcQjYrcRzx53QJjSxarj2afYWcLteoGVky7D3UKDP9QyrLprQ3VCECoY49yfdDEHGCtMMj92pReUsQ";

const TESTNET_TPUB: &str = "tpubDEXZPZzoVxHQdZg6ndWKoDXwsPtfTKpYsF6SDCm2dHxydcNvoKM58RmA7FDj3hXqy8BrxfwoTNaV5SzWgCzurTaQmDNywHVvv5tPSj6Evgr";

fn taproot_chain(change: bool) -> AddressChain {
    AddressChain::new(
        Xpub::from_str(BIP86_XPUB).unwrap(),
        DerivationPath::from_str("m/86'/0'/0'").unwrap(),
        ScriptType::P2tr,
        Network::Bitcoin,
        2,
        change,
    )
}

#[test]
fn test_bip86_receive_addresses() {
    let addresses = taproot_chain(false).ensure_addresses().unwrap();
    assert_eq!(
        addresses[0].encode(),
        "bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr"
    );
    assert_eq!(
        addresses[1].encode(),
        "bc1p4qhjn9zdvkux4e44uhx8tc55attvtyu358kutcqkudyccelu0was9fqzwh"
    );
    assert_eq!(addresses[1].derivation.address_index, 1);
    assert_eq!(
        addresses[1].keypath,
        DerivationPath::from_str("m/86'/0'/0'/0/1").unwrap()
    );
}

#[test]
fn test_bip86_change_address() {
    let addresses = taproot_chain(true).ensure_addresses().unwrap();
    assert_eq!(
        addresses[0].encode(),
        "bc1p3qkhfews2uk44qtvauqyr2ttdsw7svhkl9nkm9s9c3x4ax5h60wqwruhk7"
    );
    assert!(addresses[0].derivation.change);
}

#[test]
fn test_fresh_legacy_chain() {
    let mut chain = AddressChain::new(
        Xpub::from_str(TESTNET_TPUB).unwrap(),
        DerivationPath::master(),
        ScriptType::P2pkh,
        Network::Testnet,
        6,
        false,
    );
    let addresses = chain.ensure_addresses().unwrap();
    assert_eq!(addresses.len(), 6);
    let first = &addresses[0];
    assert_eq!(first.encode(), "n2gAErwJCuPmnQuhzPkkWi2haGz9oQxjnX");
    assert_eq!(
        first.script_hash(),
        &ScriptHashHex::from_script(first.pk_script())
    );
    assert!(!first.is_used());
}

#[test]
fn test_every_script_type_derives_distinct_scripts() {
    let xpub = Xpub::from_str(TESTNET_TPUB).unwrap();
    let mut scripts = Vec::new();
    for script_type in ScriptType::ALL {
        let mut chain = AddressChain::new(
            xpub,
            DerivationPath::master(),
            script_type,
            Network::Testnet,
            1,
            false,
        );
        let address = chain.ensure_addresses().unwrap().remove(0);
        assert_eq!(address.script_type, script_type);
        assert_eq!(
            address.redeem_script().is_some(),
            script_type == ScriptType::P2wpkhP2sh
        );
        scripts.push(address.pk_script().clone());
    }
    scripts.sort();
    scripts.dedup();
    assert_eq!(scripts.len(), ScriptType::ALL.len());
}
