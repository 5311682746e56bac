mod common;

use std::time::Duration;

use delegate_chain::crypto::address_from_public_key;
use delegate_chain::errors::ChainError;
use delegate_chain::node::TX_STATUS_PROCESSED;
use delegate_chain::types::Transaction;

use common::{wait_until, Cluster, INTERVAL_MS, USER_FUNDS, USER_GAS};

fn transfer(cluster: &Cluster, to: &str, amount: i64, fee: i64, nonce: u64) -> Transaction {
    Transaction::signed(
        &cluster.user,
        to.to_string(),
        nonce,
        amount,
        fee,
        nonce,
        String::new(),
        String::new(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_delegates_commit_blocks_and_transactions() {
    let cluster = Cluster::new(2);
    let a = cluster.delegate(0);
    let b = cluster.delegate(1);
    let receiver = "cd".repeat(32);

    let first = transfer(&cluster, &receiver, 100, 3, 1);
    let second = transfer(&cluster, &receiver, 200, 4, 2);
    let first_id = a.handle.submit_transaction(first).expect("first accepted");
    let second_id = b.handle.submit_transaction(second.clone()).expect("second accepted");
    // Both delegates need the transactions; whoever proposes drains its own pool.
    a.handle.submit_transaction(second).expect("second accepted by a");

    a.handle.spawn_tasks();
    b.handle.spawn_tasks();

    let committed = wait_until(Duration::from_secs(30), || {
        [&a, &b].iter().all(|node| {
            node.handle.transaction_status(&first_id).ok().flatten() == Some(TX_STATUS_PROCESSED)
                && node.handle.transaction_status(&second_id).ok().flatten()
                    == Some(TX_STATUS_PROCESSED)
        })
    })
    .await;
    assert!(committed, "transactions were not committed on both delegates");

    let reached = wait_until(Duration::from_secs(30), || {
        a.handle.chain().last_height() >= 3 && b.handle.chain().last_height() >= 3
    })
    .await;
    assert!(reached, "chain did not keep advancing");
    a.handle.shutdown().await;
    b.handle.shutdown().await;

    // Both nodes agree on every committed header.
    let height = a.handle.chain().last_height().min(b.handle.chain().last_height());
    for h in 1..=height {
        let left = a.handle.header_by_height(h).expect("read").expect("header");
        let right = b.handle.header_by_height(h).expect("read").expect("header");
        assert_eq!(left, right, "divergence at height {h}");
        assert!(right.timestamp > 0);
    }

    // Proposers alternate after genesis.
    let first_block = a.handle.header_by_height(1).expect("read").expect("header");
    let second_block = a.handle.header_by_height(2).expect("read").expect("header");
    assert_eq!(first_block.coinbase, address_from_public_key(&a.keypair.public));
    assert_ne!(first_block.coinbase, second_block.coinbase);
    // The second delegate only ever holds the odd slots of each cycle.
    let delta = second_block.timestamp - first_block.timestamp;
    assert_eq!(delta % (2 * INTERVAL_MS), INTERVAL_MS);

    let user = cluster.user_address();
    let account = a.handle.account(&user).expect("read").expect("user");
    assert_eq!(account.amount, USER_FUNDS - 300);
    assert_eq!(account.gas, USER_GAS - 7);
    assert_eq!(account.nonce, 2);
    assert_eq!(a.handle.account(&receiver).expect("read").expect("receiver").amount, 300);
    assert!(a.handle.receipt(&first_id).expect("read").expect("receipt").success);

    // Every fee burned from the user ended up with a proposer.
    let miners_gas: i64 = cluster
        .delegates
        .iter()
        .map(|key| {
            a.handle
                .account(&address_from_public_key(&key.public))
                .expect("read")
                .map_or(0, |account| account.gas)
        })
        .sum();
    assert_eq!(miners_gas, 7);
    assert_eq!(a.handle.nonce(&user).expect("nonce"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_single_vote_of_two_never_commits() {
    let cluster = Cluster::new(2);
    let a = cluster.delegate(0);
    let b = cluster.delegate(1);
    cluster.network.disconnect(b.handle.address());

    a.handle.spawn_tasks();
    tokio::time::sleep(Duration::from_millis(INTERVAL_MS * 3)).await;
    assert_eq!(a.handle.chain().last_height(), 0);

    cluster.network.register(b.handle.clone());
    b.handle.spawn_tasks();
    let committed = wait_until(Duration::from_secs(30), || {
        a.handle.chain().last_height() >= 1 && b.handle.chain().last_height() >= 1
    })
    .await;
    assert!(committed, "quorum of two never formed");
    a.handle.shutdown().await;
    b.handle.shutdown().await;

    let block = a.handle.block_by_height(1).expect("read").expect("block");
    let votes = a.handle.votes(&block.hash).expect("votes");
    assert_eq!(votes.len(), 2);
}

#[tokio::test]
async fn negative_amounts_never_reach_the_pool() {
    let cluster = Cluster::new(1);
    let node = cluster.delegate(0);
    let tx = transfer(&cluster, &"cd".repeat(32), -1, 1, 1);
    let id = tx.id();
    match node.handle.submit_transaction(tx) {
        Err(ChainError::Transaction(_)) => {}
        other => panic!("expected a rejected transaction, got {other:?}"),
    }
    assert_eq!(node.handle.transaction_status(&id).expect("status"), None);
    assert!(node.handle.user_txs(&cluster.user_address()).is_empty());
    assert_eq!(node.handle.status().pool.pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_node_catches_up_by_height() {
    let cluster = Cluster::new(2);
    let a = cluster.delegate(0);
    let b = cluster.delegate(1);
    let tx = transfer(&cluster, &"ef".repeat(32), 50, 2, 1);
    a.handle.submit_transaction(tx.clone()).expect("accepted");
    b.handle.submit_transaction(tx).expect("accepted");
    a.handle.spawn_tasks();
    b.handle.spawn_tasks();
    assert!(
        wait_until(Duration::from_secs(30), || a.handle.chain().last_height() >= 3).await,
        "delegates did not produce blocks"
    );

    let follower = cluster.full_node();
    assert_eq!(follower.handle.mode(), "full");
    follower.handle.spawn_tasks();
    let target = a.handle.chain().last_height();
    assert!(
        wait_until(Duration::from_secs(30), || follower.handle.chain().last_height() >= target).await,
        "follower did not catch up"
    );
    a.handle.shutdown().await;
    b.handle.shutdown().await;
    follower.handle.shutdown().await;

    let ours = follower.handle.header_by_height(target).expect("read").expect("header");
    let theirs = a.handle.header_by_height(target).expect("read").expect("header");
    assert_eq!(ours, theirs);
    let receiver = follower
        .handle
        .account(&"ef".repeat(32))
        .expect("read")
        .expect("receiver");
    assert_eq!(receiver.amount, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lone_delegate_is_its_own_quorum() {
    let cluster = Cluster::new(1);
    let node = cluster.delegate(0);
    node.handle.spawn_tasks();
    assert!(
        wait_until(Duration::from_secs(15), || node.handle.chain().last_height() >= 2).await,
        "single delegate did not commit"
    );
    node.handle.shutdown().await;

    let first = node.handle.header_by_height(1).expect("read").expect("header");
    let second = node.handle.header_by_height(2).expect("read").expect("header");
    assert_eq!(second.previous_hash, first.hash());
    assert_eq!((second.timestamp - first.timestamp) % INTERVAL_MS, 0);
    let votes = node.handle.votes(&first.hash()).expect("votes");
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].voter.account, node.handle.address());
}
