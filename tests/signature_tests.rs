//! ECDSA spends end to end: signatures made with real keys over the digests
//! the interpreter computes, for P2PKH, P2WPKH and bare multisig

mod common;

use aureus_kernel::hashes::hash160;
use aureus_kernel::opcodes::*;
use aureus_kernel::script::ScriptBuilder;
use aureus_kernel::sighash::{legacy_signature_hash, segwit_v0_signature_hash, SIGHASH_ALL};
use aureus_kernel::*;
use common::*;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

const AMOUNT: i64 = 50;

fn key(n: u8) -> (SecretKey, Vec<u8>) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[n; 32]).unwrap();
    let public = PublicKey::from_secret_key(&secp, &secret).serialize().to_vec();
    (secret, public)
}

/// DER signature with the SIGHASH_ALL byte appended
fn sign(secret: &SecretKey, digest: &[u8; 32]) -> Vec<u8> {
    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(digest).unwrap();
    let mut sig = secp.sign_ecdsa(&message, secret).serialize_der().to_vec();
    sig.push(SIGHASH_ALL);
    sig
}

fn p2pkh(pubkey: &[u8]) -> Vec<u8> {
    ScriptBuilder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(&hash160(pubkey))
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_bytes()
}

fn verify(script_pubkey: &[u8], tx: &Transaction, flags: VerificationFlags) -> bool {
    let txdata = PrecomputedTransactionData::new(tx, vec![]).unwrap();
    verify_script_pubkey(script_pubkey, AMOUNT, tx, &txdata, 0, flags.bits()).unwrap()
}

fn standard_flags() -> VerificationFlags {
    VerificationFlags::P2SH | VerificationFlags::WITNESS | VerificationFlags::NULLDUMMY
}

#[test]
fn test_p2pkh_signature() {
    let (secret, pubkey) = key(1);
    let script_pubkey = p2pkh(&pubkey);
    let mut tx = spend(&coinbase(1, AMOUNT, 0), 40);
    let digest = legacy_signature_hash(&script_pubkey, &tx, 0, SIGHASH_ALL as u32);
    tx.inputs[0].script_sig = ScriptBuilder::new()
        .push_slice(&sign(&secret, &digest))
        .push_slice(&pubkey)
        .into_bytes();
    assert!(verify(&script_pubkey, &tx, standard_flags()));

    // the signature commits to the outputs
    let mut tampered = tx.clone();
    tampered.outputs[0].value = 41;
    assert!(!verify(&script_pubkey, &tampered, standard_flags()));

    // a different key does not match the committed hash
    let (other_secret, other_pubkey) = key(2);
    let mut wrong_key = tx.clone();
    wrong_key.inputs[0].script_sig = ScriptBuilder::new()
        .push_slice(&sign(&other_secret, &digest))
        .push_slice(&other_pubkey)
        .into_bytes();
    assert!(!verify(&script_pubkey, &wrong_key, standard_flags()));
}

#[test]
fn test_p2wpkh_signature() {
    let (secret, pubkey) = key(3);
    let script_pubkey = ScriptBuilder::new()
        .push_opcode(OP_0)
        .push_slice(&hash160(&pubkey))
        .into_bytes();
    let script_code = p2pkh(&pubkey);
    let mut tx = spend(&coinbase(1, AMOUNT, 0), 40);
    let txdata = PrecomputedTransactionData::new(&tx, vec![]).unwrap();
    let digest = segwit_v0_signature_hash(&script_code, &tx, 0, SIGHASH_ALL as u32, AMOUNT, &txdata);
    tx.inputs[0].witness = vec![sign(&secret, &digest), pubkey.clone()];
    assert!(verify(&script_pubkey, &tx, standard_flags()));

    // BIP143 commits to the spent amount
    let txdata = PrecomputedTransactionData::new(&tx, vec![]).unwrap();
    let flags = standard_flags().bits();
    assert!(!verify_script_pubkey(&script_pubkey, AMOUNT + 1, &tx, &txdata, 0, flags).unwrap());

    // the witness program must not be satisfied from the script_sig
    let mut malleated = tx.clone();
    malleated.inputs[0].script_sig = ScriptBuilder::new().push_opcode(OP_TRUE).into_bytes();
    assert!(!verify(&script_pubkey, &malleated, standard_flags()));
}

#[test]
fn test_multisig_two_of_three() {
    let keys: Vec<_> = (10..13).map(key).collect();
    let mut builder = ScriptBuilder::new().push_opcode(OP_2);
    for (_, pubkey) in &keys {
        builder = builder.push_slice(pubkey);
    }
    let script_pubkey = builder.push_opcode(OP_3).push_opcode(OP_CHECKMULTISIG).into_bytes();

    let unsigned = spend(&coinbase(1, AMOUNT, 0), 40);
    let digest = legacy_signature_hash(&script_pubkey, &unsigned, 0, SIGHASH_ALL as u32);
    let first = sign(&keys[0].0, &digest);
    let third = sign(&keys[2].0, &digest);
    let with_sigs = |dummy: u8, sigs: [&Vec<u8>; 2]| {
        let mut tx = unsigned.clone();
        tx.inputs[0].script_sig = ScriptBuilder::new()
            .push_opcode(dummy)
            .push_slice(sigs[0])
            .push_slice(sigs[1])
            .into_bytes();
        tx
    };

    assert!(verify(&script_pubkey, &with_sigs(OP_0, [&first, &third]), standard_flags()));
    // signatures must follow the key order
    assert!(!verify(&script_pubkey, &with_sigs(OP_0, [&third, &first]), standard_flags()));
    // the extra stack element consumed by CHECKMULTISIG must be empty under NULLDUMMY
    let non_null = with_sigs(OP_1, [&first, &third]);
    assert!(!verify(&script_pubkey, &non_null, standard_flags()));
    assert!(verify(&script_pubkey, &non_null, VerificationFlags::P2SH));
}

/// Native P2WPKH example from BIP143
#[test]
fn test_bip143_native_p2wpkh_digest() {
    let unsigned = hex::decode(
        "0100000002fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f0000000000eeffffff\
         ef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57b90ec68a0100000000ffffffff02202cb206\
         000000001976a9148280b37df378db99f66f85c95a783a76ac7a6d5988ac9093510d000000001976a9143bde42db\
         ee7e4dbe6a21b2d50ce2f0167faa815988ac11000000",
    )
    .unwrap();
    let mut tx = Transaction::from_bytes(&unsigned).unwrap();
    let amount = 600_000_000;
    let script_code = hex::decode("76a9141d0f172a0ecb48aee1be1f2687d2963ae33f71a188ac").unwrap();
    let txdata = PrecomputedTransactionData::new(&tx, vec![]).unwrap();

    let digest = segwit_v0_signature_hash(&script_code, &tx, 1, SIGHASH_ALL as u32, amount, &txdata);
    assert_eq!(
        hex::encode(digest),
        "c37af31116d1b27caf68aae9e3ac82f1477929014d5b917657d0eb49478cb670"
    );

    let secret =
        SecretKey::from_slice(&hex::decode("619c335025c7f4012e556c2a58b2506e30b8511b53ade95ea316fd8c3286feb9").unwrap())
            .unwrap();
    let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &secret).serialize().to_vec();
    assert_eq!(
        hex::encode(&pubkey),
        "025476c2e83188368da1ff3e292e7acafcdb3566bb0ad253f62fc70f07aeee6357"
    );
    tx.inputs[1].witness = vec![sign(&secret, &digest), pubkey];
    let script_pubkey = hex::decode("00141d0f172a0ecb48aee1be1f2687d2963ae33f71a1").unwrap();
    let txdata = PrecomputedTransactionData::new(&tx, vec![]).unwrap();
    let flags = standard_flags().bits();
    assert!(verify_script_pubkey(&script_pubkey, amount, &tx, &txdata, 1, flags).unwrap());
}
