//! Chainstate manager behaviour on regtest: connecting, idempotence, header
//! rejection, maturity and reorganizations

mod common;

use aureus_kernel::constants::COIN;
use aureus_kernel::*;
use common::*;
use std::sync::Arc;

#[test]
fn test_connect_extends_chain() {
    let (manager, recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();
    let block = mine(&genesis, vec![coinbase(1, 50 * COIN, 0)]);
    let hash = block.block_hash();

    let processed = manager.process_block(block).unwrap();
    assert!(processed.new_block);
    assert!(processed.state.is_valid());
    assert_eq!(manager.height(), 1);
    assert_eq!(manager.tip().unwrap().hash, hash);
    assert_eq!(manager.tip().unwrap().status(), BlockStatus::FullyValid);

    let events = recorder.take();
    assert_eq!(
        events,
        vec![
            Event::HeaderTip(1),
            Event::PowValid(hash),
            Event::Checked(hash, true),
            Event::Connected(hash),
            Event::Tip(1),
        ]
    );
}

#[test]
fn test_process_block_twice_is_noop() {
    let (manager, recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();
    let block = mine(&genesis, vec![coinbase(1, 50 * COIN, 0)]);

    assert!(manager.process_block(block.clone()).unwrap().new_block);
    let again = manager.process_block(block.clone()).unwrap();
    assert!(!again.new_block);
    assert!(again.state.is_valid());
    assert_eq!(recorder.connected(), vec![block.block_hash()]);
    assert_eq!(manager.height(), 1);
}

#[test]
fn test_header_with_unknown_parent() {
    let (manager, _recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();
    let mut header = mine(&genesis, vec![coinbase(1, 50 * COIN, 0)]).header;
    header.prev_block_hash = BlockHash::from_byte_array([0xab; 32]);
    let header = solve(header);

    let state = manager.process_block_header(&header).unwrap();
    assert!(state.is_invalid());
    assert_eq!(state.result(), BlockValidationResult::MissingPrev);
    assert!(manager.block_tree_entry(&header.block_hash()).is_none());
    assert_eq!(manager.best_header().unwrap().hash, genesis.hash);
}

#[test]
fn test_header_with_bad_proof_of_work() {
    let (manager, _recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();
    let header = unsolved_header(&genesis);

    let state = manager.process_block_header(&header).unwrap();
    assert_eq!(state.result(), BlockValidationResult::InvalidHeader);
    assert_eq!(state.reject_reason(), "high-hash");
    assert!(manager.block_tree_entry(&header.block_hash()).is_none());
}

#[test]
fn test_header_accepted_before_body() {
    let (manager, recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();
    let block = mine(&genesis, vec![coinbase(1, 50 * COIN, 0)]);

    let state = manager.process_block_header(&block.header).unwrap();
    assert!(state.is_valid());
    let entry = manager.block_tree_entry(&block.block_hash()).unwrap();
    assert_eq!(entry.status(), BlockStatus::HeaderOnly);
    assert_eq!(manager.best_header().unwrap().hash, entry.hash);
    assert_eq!(manager.height(), 0);
    assert_eq!(recorder.take(), vec![Event::HeaderTip(1)]);

    manager.process_block(block).unwrap();
    assert_eq!(entry.status(), BlockStatus::FullyValid);
    assert_eq!(manager.height(), 1);
}

#[test]
fn test_low_work_header_rejected() {
    let recorder = Arc::new(Recorder::default());
    let mut options = in_memory_options();
    options.low_work_buffer = 0;
    let manager = ChainstateManager::new(regtest_context(&recorder), options).unwrap();
    let genesis = manager.tip().unwrap();
    for tag in 0..3 {
        extend(&manager, tag);
    }

    let fork = branch(&genesis, 1, 9);
    let state = manager.process_block_header(&fork[0].header).unwrap();
    assert_eq!(state.result(), BlockValidationResult::HeaderLowWork);

    // full blocks are not subject to the header floor
    let processed = manager.process_block(fork[0].clone()).unwrap();
    assert!(processed.new_block);
    assert_eq!(manager.height(), 3);
}

#[test]
fn test_coinbase_maturity() {
    let (manager, _recorder) = regtest_manager();
    let (_, first_coinbase) = extend(&manager, 0);
    for _ in 2..100 {
        extend(&manager, 0);
    }
    assert_eq!(manager.height(), 99);

    // height 100 is one confirmation short
    let tip = manager.tip().unwrap();
    let early = mine(
        &tip,
        vec![coinbase(100, 50 * COIN, 1), spend(&first_coinbase, 49 * COIN)],
    );
    let processed = manager.process_block(early.clone()).unwrap();
    assert!(processed.state.is_invalid());
    assert_eq!(processed.state.reject_reason(), "bad-txns-premature-spend-of-coinbase");
    assert_eq!(manager.height(), 99);
    assert!(manager.block_tree_entry(&early.block_hash()).unwrap().is_invalid());

    extend(&manager, 2);
    let tip = manager.tip().unwrap();
    let mature = mine(
        &tip,
        vec![coinbase(101, 51 * COIN, 0), spend(&first_coinbase, 49 * COIN)],
    );
    let processed = manager.process_block(mature).unwrap();
    assert!(processed.state.is_valid(), "{}", processed.state);
    assert_eq!(manager.height(), 101);
    assert!(manager.get_coin(&OutPoint::new(first_coinbase.txid(), 0)).unwrap().is_none());
}

#[test]
fn test_block_with_invalid_ancestor_rejected() {
    let (manager, _recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();
    let bad = mine(&genesis, vec![coinbase(1, 50 * COIN + 1, 0)]);
    let processed = manager.process_block(bad.clone()).unwrap();
    assert_eq!(processed.state.reject_reason(), "bad-cb-amount");

    let bad_entry = manager.block_tree_entry(&bad.block_hash()).unwrap();
    let child = mine(&bad_entry, vec![coinbase(2, 50 * COIN, 0)]);
    let processed = manager.process_block(child).unwrap();
    assert!(!processed.new_block);
    assert_eq!(processed.state.result(), BlockValidationResult::InvalidPrev);

    let again = manager.process_block(bad).unwrap();
    assert_eq!(again.state.result(), BlockValidationResult::CachedInvalid);
}

#[test]
fn test_mutated_block_does_not_poison_header() {
    let (manager, _recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();
    let block = mine(&genesis, vec![coinbase(1, 50 * COIN, 0)]);
    manager.process_block_header(&block.header).unwrap();

    let mut mutated = (*block).clone();
    mutated.transactions.push(Arc::new(spend(&coinbase(1, 50 * COIN, 0), 1)));
    let processed = manager.process_block(Arc::new(mutated)).unwrap();
    assert_eq!(processed.state.result(), BlockValidationResult::Mutated);

    let processed = manager.process_block(block).unwrap();
    assert!(processed.state.is_valid());
    assert_eq!(manager.height(), 1);
}

#[test]
fn test_equal_work_keeps_first_seen() {
    let (manager, _recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();
    let a = branch(&genesis, 2, 1);
    let b = branch(&genesis, 2, 2);
    for block in a.iter().chain(b.iter()) {
        manager.process_block(block.clone()).unwrap();
    }
    assert_eq!(manager.tip().unwrap().hash, a[1].block_hash());
}

#[test]
fn test_reorg_to_more_work() {
    let (manager, recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();
    let a = branch(&genesis, 2, 1);
    let b = branch(&genesis, 3, 2);
    for block in &a {
        manager.process_block(block.clone()).unwrap();
    }
    for block in &b[..2] {
        manager.process_block(block.clone()).unwrap();
    }
    recorder.take();

    manager.process_block(b[2].clone()).unwrap();
    assert_eq!(manager.tip().unwrap().hash, b[2].block_hash());
    assert_eq!(manager.height(), 3);

    let order: Vec<Event> = recorder
        .take()
        .into_iter()
        .filter(|e| matches!(e, Event::Connected(_) | Event::Disconnected(_)))
        .collect();
    assert_eq!(
        order,
        vec![
            Event::Disconnected(a[1].block_hash()),
            Event::Disconnected(a[0].block_hash()),
            Event::Connected(b[0].block_hash()),
            Event::Connected(b[1].block_hash()),
            Event::Connected(b[2].block_hash()),
        ]
    );

    let chain = manager.active_chain();
    for (height, block) in b.iter().enumerate() {
        assert_eq!(chain.at(height as u32 + 1).unwrap().hash, block.block_hash());
    }
    let a_coinbase = a[0].transactions[0].txid();
    let b_coinbase = b[0].transactions[0].txid();
    assert!(manager.get_coin(&OutPoint::new(a_coinbase, 0)).unwrap().is_none());
    assert!(manager.get_coin(&OutPoint::new(b_coinbase, 0)).unwrap().is_some());
}

#[test]
fn test_failed_reorg_restores_old_tip() {
    let (manager, _recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();
    let a = branch(&genesis, 2, 1);
    for block in &a {
        manager.process_block(block.clone()).unwrap();
    }

    let b1 = mine(&genesis, vec![coinbase(1, 50 * COIN, 2)]);
    let b1_entry = BlockTreeEntry::extend(&genesis, b1.header);
    let b2 = mine(&b1_entry, vec![coinbase(2, 60 * COIN, 2)]);
    let b2_entry = BlockTreeEntry::extend(&b1_entry, b2.header);
    let b3 = mine(&b2_entry, vec![coinbase(3, 50 * COIN, 2)]);
    for block in [&b1, &b2, &b3] {
        manager.process_block(block.clone()).unwrap();
    }

    assert_eq!(manager.tip().unwrap().hash, a[1].block_hash());
    assert!(manager.block_tree_entry(&b2.block_hash()).unwrap().is_invalid());
    assert_eq!(
        manager.block_tree_entry(&b3.block_hash()).unwrap().status(),
        BlockStatus::Invalid { failed_child: true }
    );
    let a_coinbase = a[0].transactions[0].txid();
    assert!(manager.get_coin(&OutPoint::new(a_coinbase, 0)).unwrap().is_some());
    assert!(manager
        .get_coin(&OutPoint::new(b1.transactions[0].txid(), 0))
        .unwrap()
        .is_none());
}

#[test]
fn test_reorg_matches_direct_connection() {
    // A spends from the shared prefix, B spends the same coin differently
    let (manager, _recorder) = regtest_manager();
    let (_, shared_coinbase) = extend(&manager, 0);
    for _ in 2..=100 {
        extend(&manager, 0);
    }
    let fork = manager.tip().unwrap();

    let a_spend = spend(&shared_coinbase, 40 * COIN);
    let a1 = mine(&fork, vec![coinbase(101, 60 * COIN, 1), a_spend.clone()]);
    let b_spend = spend(&shared_coinbase, 30 * COIN);
    let b1 = mine(&fork, vec![coinbase(101, 70 * COIN, 2), b_spend.clone()]);
    let b1_entry = BlockTreeEntry::extend(&fork, b1.header);
    let b2 = mine(&b1_entry, vec![coinbase(102, 50 * COIN, 2)]);

    manager.process_block(a1.clone()).unwrap();
    assert!(manager.get_coin(&OutPoint::new(a_spend.txid(), 0)).unwrap().is_some());
    manager.process_block(b1.clone()).unwrap();
    manager.process_block(b2.clone()).unwrap();
    assert_eq!(manager.tip().unwrap().hash, b2.block_hash());

    // replay the prefix and B directly into a fresh manager
    let (direct, _recorder) = regtest_manager();
    for height in 1..=100u32 {
        let block = manager.read_block(manager.active_chain().at(height).unwrap()).unwrap();
        direct.process_block(block).unwrap();
    }
    direct.process_block(b1).unwrap();
    direct.process_block(b2).unwrap();
    assert_eq!(direct.tip().unwrap().hash, manager.tip().unwrap().hash);

    let outpoints = [
        OutPoint::new(shared_coinbase.txid(), 0),
        OutPoint::new(a_spend.txid(), 0),
        OutPoint::new(b_spend.txid(), 0),
        OutPoint::new(a1.transactions[0].txid(), 0),
    ];
    for outpoint in &outpoints {
        assert_eq!(manager.get_coin(outpoint).unwrap(), direct.get_coin(outpoint).unwrap());
    }
    assert!(manager.get_coin(&outpoints[0]).unwrap().is_none());
    assert!(manager.get_coin(&outpoints[1]).unwrap().is_none());
    assert!(manager.get_coin(&outpoints[2]).unwrap().is_some());
}

#[test]
fn test_read_block_and_spent_outputs() {
    let (manager, _recorder) = regtest_manager();
    let (_, first_coinbase) = extend(&manager, 0);
    for _ in 2..=100 {
        extend(&manager, 0);
    }
    let tip = manager.tip().unwrap();
    let block = mine(&tip, vec![coinbase(101, 50 * COIN, 0), spend(&first_coinbase, 50 * COIN)]);
    manager.process_block(block.clone()).unwrap();

    let entry = manager.tip().unwrap();
    assert_eq!(*manager.read_block(&entry).unwrap(), *block);
    let undo = manager.read_spent_outputs(&entry).unwrap();
    assert_eq!(undo.count(), 1);
    let coin = &undo.transactions[0].coins[0];
    assert_eq!(coin.height, 1);
    assert!(coin.is_coinbase);
    assert_eq!(coin.output, first_coinbase.outputs[0]);
}

#[test]
fn test_unknown_version_bits_warning() {
    let (manager, recorder) = regtest_manager();
    for height in 1..=51u32 {
        let tip = manager.tip().unwrap();
        let mut block = (*mine(&tip, vec![coinbase(height, 50 * COIN, 0)])).clone();
        block.header.version |= 1 << 27;
        block.header = solve(block.header);
        manager.process_block(Arc::new(block)).unwrap();
    }
    assert_eq!(manager.height(), 51);
    assert_eq!(manager.warnings(), vec![Warning::UnknownNewRulesActivated]);
    let set: Vec<Event> = recorder
        .take()
        .into_iter()
        .filter(|e| matches!(e, Event::WarningSet(_)))
        .collect();
    assert_eq!(set, vec![Event::WarningSet(Warning::UnknownNewRulesActivated)]);
}

#[test]
fn test_large_invalid_chain_warning() {
    let (manager, recorder) = regtest_manager();
    let genesis = manager.tip().unwrap();

    // eight headers whose first body overpays its coinbase
    let bad = mine(&genesis, vec![coinbase(1, 50 * COIN + 1, 7)]);
    let bad_entry = BlockTreeEntry::extend(&genesis, bad.header);
    let rest = branch(&bad_entry, 7, 7);
    manager.process_block_header(&bad.header).unwrap();
    for block in &rest {
        assert!(manager.process_block_header(&block.header).unwrap().is_valid());
    }
    assert_eq!(manager.best_header().unwrap().height, 8);

    let processed = manager.process_block(bad).unwrap();
    assert_eq!(processed.state.reject_reason(), "bad-cb-amount");
    assert_eq!(manager.best_header().unwrap().hash, genesis.hash);
    assert!(manager.warnings().contains(&Warning::LargeWorkInvalidChain));
    assert!(recorder
        .take()
        .contains(&Event::WarningSet(Warning::LargeWorkInvalidChain)));

    // enough valid work clears it
    for tag in 0..3 {
        extend(&manager, tag);
    }
    assert!(!manager.warnings().contains(&Warning::LargeWorkInvalidChain));
    assert!(recorder
        .take()
        .contains(&Event::WarningUnset(Warning::LargeWorkInvalidChain)));
}

/// Queries the manager from inside its own callbacks
#[derive(Default)]
struct Inspector {
    manager: std::sync::OnceLock<std::sync::Weak<ChainstateManager>>,
    seen: parking_lot::Mutex<Vec<(u32, bool)>>,
}

impl ValidationInterface for Inspector {
    fn block_connected(&self, block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {
        let manager = match self.manager.get().and_then(|m| m.upgrade()) {
            Some(manager) => manager,
            None => return,
        };
        let best = manager.best_header().unwrap();
        let coin = manager
            .get_coin(&OutPoint::new(block.transactions[0].txid(), 0))
            .unwrap();
        assert!(manager.block_tree_entry(&entry.hash).is_some());
        self.seen.lock().push((best.height, coin.is_some()));
    }
}

#[test]
fn test_callbacks_may_query_manager() {
    let inspector = Arc::new(Inspector::default());
    let context = Context::new(
        ContextOptions::new()
            .chain_type(ChainType::Regtest)
            .validation_interface(inspector.clone()),
    );
    let manager = Arc::new(ChainstateManager::new(context, in_memory_options()).unwrap());
    inspector.manager.set(Arc::downgrade(&manager)).unwrap();

    let (done, finished) = std::sync::mpsc::channel();
    let worker = Arc::clone(&manager);
    std::thread::spawn(move || {
        let genesis = worker.tip().unwrap();
        let block = mine(&genesis, vec![coinbase(1, 50 * COIN, 0)]);
        let processed = worker.process_block(block).unwrap();
        done.send(processed.state.is_valid()).unwrap();
    });

    let valid = finished
        .recv_timeout(std::time::Duration::from_secs(30))
        .expect("process_block deadlocked on a re-entrant callback");
    assert!(valid);
    assert_eq!(*inspector.seen.lock(), vec![(1, true)]);
}
