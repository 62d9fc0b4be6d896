//! Escrow to settlement: checkpoints driven by streamed usage, padding of the
//! final claim and the 90/10 split.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{end, host, script, user, FixtureBuilder, HostFrame, PRICE};
use ethers::types::U256;
use market_client::checkpoint::{CommitmentProofProvider, ProofMaterial, ProofProvider};
use market_client::escrow::{InMemoryChain, PaymentToken};
use market_client::session::PromptOptions;
use market_client::{MarketError, SessionStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

fn answer(tokens: u64) -> common::Script {
    script(move |_, _| vec![HostFrame::Chunk("answer", true), end(tokens)])
}

/// Never finishes proving for one chosen session
#[derive(Default)]
struct StallingProver {
    stalled: Mutex<Option<U256>>,
    entered: Notify,
}

#[async_trait]
impl ProofProvider for StallingProver {
    async fn prove(
        &self,
        session_id: U256,
        from_tokens: u64,
        to_tokens: u64,
        ordinal: u64,
    ) -> market_client::Result<ProofMaterial> {
        let stall = *self.stalled.lock().unwrap() == Some(session_id);
        if stall {
            self.entered.notify_one();
            std::future::pending::<()>().await;
        }
        CommitmentProofProvider
            .prove(session_id, from_tokens, to_tokens, ordinal)
            .await
    }
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_settlement() -> Result<()> {
    let chain = Arc::new(
        InMemoryChain::new(common::CHAIN_ID).with_proof_cooldown(Duration::from_secs(5)),
    );
    let fixture = FixtureBuilder::new()
        .chain(chain.clone())
        .config(|c| c.checkpoint.cooldown_secs = 5)
        .with_scheduler()
        .wallet(2_000_000)
        .build(answer(500));

    let session_id = fixture.open(2_000_000).await;
    assert_eq!(
        chain.wallet_balance(user(), PaymentToken::Native),
        U256::zero()
    );

    for i in 0..3 {
        let options = market_client::PromptOptions::streaming(|_| {});
        fixture
            .protocol
            .send_prompt(session_id, &format!("question {}", i), options)
            .await?;
    }

    let before_end = fixture.protocol.get_session(session_id).await?;
    assert_eq!(before_end.total_tokens_streamed, 1500);
    assert_eq!(before_end.checkpoints.len(), 3);
    assert_eq!(before_end.tokens_proven(), 1500);
    assert_eq!(chain.proofs(session_id).len(), 3);

    fixture.protocol.end_session(session_id).await?;

    let session = fixture.protocol.get_session(session_id).await?;
    assert_eq!(session.status, SessionStatus::Completed);
    // Nothing was pending, so the forced checkpoint at end is a no-op
    assert_eq!(session.checkpoints.len(), 3);

    // 1500 tokens * 2000 / 1000 = 3000, split 2700 / 300
    assert_eq!(chain.wallet_balance(host(), PaymentToken::Native), U256::from(2700u64));
    assert_eq!(
        chain.wallet_balance(chain.treasury(), PaymentToken::Native),
        U256::from(300u64)
    );
    assert_eq!(
        chain.wallet_balance(user(), PaymentToken::Native),
        U256::from(1_997_000u64)
    );
    assert!(fixture.host.frame_types().contains(&"session_end".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_final_checkpoint_padded_to_minimum() -> Result<()> {
    let fixture = FixtureBuilder::new().with_scheduler().build(answer(37));
    let session_id = fixture.open(1_000_000).await;

    fixture
        .protocol
        .send_prompt(session_id, "short", market_client::PromptOptions::default())
        .await?;
    let mid = fixture.protocol.get_session(session_id).await?;
    assert!(mid.checkpoints.is_empty());
    assert_eq!(mid.pending_tokens(), 37);

    fixture.protocol.end_session(session_id).await?;

    let session = fixture.protocol.get_session(session_id).await?;
    assert_eq!(session.checkpoints.len(), 1);
    assert_eq!(session.checkpoints[0].tokens_claimed, 100);
    assert!(session.checkpoints[0].verified);
    assert_eq!(session.total_tokens_streamed, 100);
    assert_eq!(session.last_checkpoint_tokens, 100);

    let proofs = fixture.chain.proofs(session_id);
    assert_eq!(proofs.len(), 1);
    assert_eq!(proofs[0].tokens_claimed, 100);

    // 100 * 2000 / 1000 = 200
    let chain = &fixture.chain;
    assert_eq!(chain.wallet_balance(host(), PaymentToken::Native), U256::from(180u64));
    assert_eq!(
        chain.wallet_balance(chain.treasury(), PaymentToken::Native),
        U256::from(20u64)
    );
    assert_eq!(
        chain.wallet_balance(user(), PaymentToken::Native),
        U256::from(10_000_000u64 - 200)
    );
    Ok(())
}

#[tokio::test]
async fn test_small_claims_wait_for_minimum() -> Result<()> {
    let fixture = FixtureBuilder::new().with_scheduler().build(answer(40));
    let session_id = fixture.open(1_000_000).await;

    for _ in 0..2 {
        fixture
            .protocol
            .send_prompt(session_id, "q", market_client::PromptOptions::default())
            .await?;
    }
    assert!(fixture.protocol.get_session(session_id).await?.checkpoints.is_empty());

    // Third prompt brings pending to 120
    fixture
        .protocol
        .send_prompt(session_id, "q", market_client::PromptOptions::default())
        .await?;
    let session = fixture.protocol.get_session(session_id).await?;
    assert_eq!(session.checkpoints.len(), 1);
    assert_eq!(session.checkpoints[0].tokens_claimed, 120);
    assert_eq!(session.pending_tokens(), 0);
    Ok(())
}

#[tokio::test]
async fn test_manual_checkpoint_without_scheduler_is_config_error() {
    let fixture = FixtureBuilder::new().build(answer(10));
    let session_id = fixture.open(1_000_000).await;
    let err = fixture
        .protocol
        .checkpoint(session_id, true)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFIGURATION_ERROR");
}

#[tokio::test]
async fn test_session_without_proofs_refunds_everything() -> Result<()> {
    let fixture = FixtureBuilder::new().build(answer(250));
    let session_id = fixture.open(1_000_000).await;
    fixture
        .protocol
        .send_prompt(session_id, "unproven", market_client::PromptOptions::default())
        .await?;

    fixture.protocol.end_session(session_id).await?;
    assert_eq!(
        fixture.chain.wallet_balance(user(), PaymentToken::Native),
        U256::from(10_000_000u64)
    );
    assert_eq!(
        fixture.chain.wallet_balance(host(), PaymentToken::Native),
        U256::zero()
    );
    Ok(())
}

#[tokio::test]
async fn test_closed_session_still_settles_and_stays_failed() -> Result<()> {
    let fixture = FixtureBuilder::new().build(answer(10));
    let session_id = fixture.open(1_000_000).await;

    fixture.protocol.close_session(session_id).await?;
    fixture.protocol.end_session(session_id).await?;

    let session = fixture.protocol.get_session(session_id).await?;
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(
        fixture.chain.wallet_balance(user(), PaymentToken::Native),
        U256::from(10_000_000u64)
    );

    // Escrow already released
    let err = fixture.protocol.end_session(session_id).await.unwrap_err();
    assert!(matches!(err, MarketError::Settlement(_)));
    Ok(())
}

#[tokio::test]
async fn test_completed_session_cannot_end_twice() -> Result<()> {
    let fixture = FixtureBuilder::new().build(answer(10));
    let session_id = fixture.open(1_000_000).await;
    fixture.protocol.end_session(session_id).await?;

    let err = fixture.protocol.end_session(session_id).await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidSessionState { .. }));
    let err = fixture
        .protocol
        .send_prompt(session_id, "late", market_client::PromptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::SessionClosed(_)));
    Ok(())
}

#[tokio::test]
async fn test_session_paid_from_deposit() -> Result<()> {
    let fixture = FixtureBuilder::new().with_scheduler().build(answer(300));
    fixture.ledger.deposit_native(U256::from(600_000u64)).await?;

    let mut request = fixture.request(500_000);
    request.use_deposit = true;
    let session_id = fixture.protocol.start_session(request).await?;

    let locked = fixture.ledger.balance(PaymentToken::Native).await?;
    assert_eq!(locked.total, U256::from(600_000u64));
    assert_eq!(locked.locked, U256::from(500_000u64));
    assert_eq!(locked.available(), U256::from(100_000u64));

    // Locked escrow cannot be withdrawn
    let err = fixture
        .ledger
        .withdraw_native(U256::from(200_000u64))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_DEPOSIT");

    fixture
        .protocol
        .send_prompt(session_id, "q", market_client::PromptOptions::default())
        .await?;
    fixture.protocol.end_session(session_id).await?;

    // 300 tokens * 2000 / 1000 = 600 claimed, the rest returns to the deposit
    let settled = fixture.ledger.balance(PaymentToken::Native).await?;
    assert_eq!(settled.locked, U256::zero());
    assert_eq!(settled.total, U256::from(600_000u64 - 600));
    assert_eq!(
        fixture.chain.wallet_balance(host(), PaymentToken::Native),
        U256::from(540u64)
    );
    Ok(())
}

#[tokio::test]
async fn test_deposit_below_one_interval_rejected_before_chain() {
    let fixture = FixtureBuilder::new().build(answer(10));
    // One proof interval (1000 tokens) at PRICE costs 2000
    let err = fixture
        .protocol
        .start_session(fixture.request(PRICE - 1))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InsufficientDeposit { .. }));
    assert!(fixture.protocol.store().is_empty().await);
    assert_eq!(
        fixture.chain.wallet_balance(user(), PaymentToken::Native),
        U256::from(10_000_000u64)
    );
}

#[tokio::test]
async fn test_stalled_proof_does_not_block_other_sessions() -> Result<()> {
    let prover = Arc::new(StallingProver::default());
    let fixture = FixtureBuilder::new()
        .prover(prover.clone())
        .build(answer(150));
    let stuck = fixture.open(1_000_000).await;
    let other = fixture.open(1_000_000).await;
    *prover.stalled.lock().unwrap() = Some(stuck);

    let protocol = fixture.protocol.clone();
    let blocked = tokio::spawn(async move {
        protocol
            .send_prompt(stuck, "slow proof", PromptOptions::default())
            .await
    });
    prover.entered.notified().await;

    tokio::time::timeout(
        Duration::from_secs(2),
        fixture
            .protocol
            .send_prompt(other, "fast proof", PromptOptions::default()),
    )
    .await??;

    let session = fixture.protocol.get_session(other).await?;
    assert_eq!(session.checkpoints.len(), 1);
    assert_eq!(fixture.chain.proofs(other).len(), 1);
    assert!(fixture.chain.proofs(stuck).is_empty());

    blocked.abort();
    Ok(())
}

#[tokio::test]
async fn test_only_settled_sessions_are_pruned() -> Result<()> {
    let fixture = FixtureBuilder::new().with_scheduler().build(answer(150));
    let settled = fixture.open(1_000_000).await;
    let closed = fixture.open(1_000_000).await;

    fixture
        .protocol
        .send_prompt(settled, "q", PromptOptions::default())
        .await?;
    fixture.protocol.end_session(settled).await?;
    fixture.protocol.close_session(closed).await?;

    let scheduler = fixture.scheduler.as_ref().unwrap();
    assert_eq!(scheduler.tracked_sessions().await, 0);

    assert_eq!(fixture.protocol.prune_finished_sessions().await, 1);
    let err = fixture.protocol.get_session(settled).await.unwrap_err();
    assert_eq!(err.code(), "SESSION_NOT_FOUND");

    // Closed but unsettled; its escrow can still be released
    let session = fixture.protocol.get_session(closed).await?;
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.settlement_tx, None);

    fixture.protocol.end_session(closed).await?;
    assert_eq!(fixture.protocol.prune_finished_sessions().await, 1);
    assert!(fixture.protocol.store().is_empty().await);
    Ok(())
}
